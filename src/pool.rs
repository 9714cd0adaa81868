//! Pools: contiguous page-aligned regions obtained from the OS mapper. A
//! small pool parcels pages out one at a time to the size-class free lists;
//! a large pool hands out runs of whole pages. All per-object state (mark,
//! scan, free and attribute bits) lives here, in bit planes indexed by the
//! pool's granule shift.

use std::ptr::NonNull;

use bitflags::bitflags;

use crate::bins::Bin;
use crate::bits::Bitset;
use crate::os;

pub const PAGESIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Default page quantum of a freshly mapped pool (1 MiB).
pub const POOL_PAGES: usize = 256;

/// Granule shift of a small pool: one bit per 16-byte granule, so every
/// small bin boundary lands on a bit.
pub const SHIFT_SMALL: usize = 4;
/// Granule shift of a large pool: one bit per page.
pub const SHIFT_LARGE: usize = PAGE_SHIFT;

bitflags! {
    /// Per-object attribute mask.
    pub struct BlkAttr: u32 {
        /// Run the finalizer callback before the block is reclaimed.
        const FINALIZE = 0b0001;
        /// The block body holds no pointers; never scanned.
        const NO_SCAN = 0b0010;
        /// Informational bit for array-style users; carried across realloc.
        const APPENDABLE = 0b0100;
        /// Only pointers to the block base keep it alive (large blocks only).
        const NO_INTERIOR = 0b1000;
    }
}

/// One mapped region. `pagetable` classifies every page; the bit planes are
/// sized to one bit per granule (`poolsize >> shift`).
pub struct Pool {
    base: NonNull<u8>,
    pub npages: usize,
    pub is_large: bool,
    pub shift: usize,
    nbits: usize,

    pub pagetable: Box<[Bin]>,
    /// Large pools only: back-offset to the owning `Page` for a `PagePlus`
    /// entry, run length (in pages, itself included) for a `Page` entry.
    pub b_page_offsets: Box<[u32]>,

    /// Number of `Free` entries in `pagetable`.
    pub freepages: usize,
    /// Smallest page index that might be free; pages below are known
    /// non-free. Monotone between frees.
    pub search_start: usize,

    pub mark: Bitset,
    pub scan: Bitset,
    /// Small pools only: slot is currently on a free list.
    pub freebits: Option<Bitset>,

    finals: Option<Bitset>,
    noscan: Option<Bitset>,
    appendable: Option<Bitset>,
    nointerior: Option<Bitset>,

    /// Worklist pass flags: `new_changes` is raised when a scan bit is set,
    /// snapshotted into `old_changes` at the top of each marking pass.
    pub old_changes: bool,
    pub new_changes: bool,
}

impl Pool {
    /// Map a pool of `npages` pages. `None` when the OS mapper refuses.
    pub fn new(npages: usize, is_large: bool) -> Option<Pool> {
        let poolsize = npages * PAGESIZE;
        let base = os::map(poolsize)?;
        let shift = if is_large { SHIFT_LARGE } else { SHIFT_SMALL };
        let nbits = poolsize >> shift;
        Some(Pool {
            base,
            npages,
            is_large,
            shift,
            nbits,
            pagetable: vec![Bin::Free; npages].into_boxed_slice(),
            b_page_offsets: if is_large {
                vec![0u32; npages].into_boxed_slice()
            } else {
                Vec::new().into_boxed_slice()
            },
            freepages: npages,
            search_start: 0,
            mark: Bitset::new(nbits),
            scan: Bitset::new(nbits),
            freebits: if is_large { None } else { Some(Bitset::new(nbits)) },
            finals: None,
            noscan: None,
            appendable: None,
            nointerior: None,
            old_changes: false,
            new_changes: false,
        })
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn top_addr(&self) -> usize {
        self.base_addr() + self.npages * PAGESIZE
    }

    #[inline]
    pub fn contains(&self, p: usize) -> bool {
        p >= self.base_addr() && p < self.top_addr()
    }

    /// Bit index of the granule holding address `p`.
    #[inline]
    pub fn bit_index(&self, p: usize) -> usize {
        debug_assert!(self.contains(p));
        (p - self.base_addr()) >> self.shift
    }

    /// Find a run of `n` consecutive free pages, scanning from the
    /// `search_start` hint. The page table is not modified; the caller
    /// classifies the run. Updates the hint: it lands on the first free
    /// page seen, advances past the run when the run started at the hint,
    /// and saturates to `npages` when the scan proves the hint stale.
    pub fn alloc_pages(&mut self, n: usize) -> Option<usize> {
        debug_assert!(n > 0);
        if self.freepages < n {
            return None;
        }
        let mut i = self.search_start;
        let mut run_start = 0;
        let mut run = 0;
        let mut seen_free = false;
        while i < self.npages {
            match self.pagetable[i] {
                Bin::Free => {
                    if run == 0 {
                        run_start = i;
                    }
                    if !seen_free {
                        seen_free = true;
                        self.search_start = i;
                    }
                    run += 1;
                    if run == n {
                        if run_start == self.search_start {
                            self.search_start = run_start + n;
                        }
                        return Some(run_start);
                    }
                    i += 1;
                }
                Bin::Page if self.is_large => {
                    run = 0;
                    i += self.b_page_offsets[i] as usize;
                }
                Bin::PagePlus if self.is_large => {
                    // landed mid-run; hop to the end of the owning block
                    run = 0;
                    let head = i - self.b_page_offsets[i] as usize;
                    i = head + self.b_page_offsets[head] as usize;
                }
                _ => {
                    run = 0;
                    i += 1;
                }
            }
        }
        if !seen_free {
            self.search_start = self.npages;
        }
        None
    }

    /// Return pages `[pn, pn + n)` to the free state.
    pub fn free_pages(&mut self, pn: usize, n: usize) {
        debug_assert!(pn + n <= self.npages);
        for entry in &mut self.pagetable[pn..pn + n] {
            *entry = Bin::Free;
        }
        self.freepages += n;
        if pn < self.search_start {
            self.search_start = pn;
        }
    }

    /// Refresh `b_page_offsets` for the block headed at `head`: run length
    /// at the head, back-offset `k` at each continuation.
    pub fn update_offsets(&mut self, head: usize) {
        debug_assert!(self.is_large);
        debug_assert_eq!(self.pagetable[head], Bin::Page);
        let mut k = 1;
        while head + k < self.npages && self.pagetable[head + k] == Bin::PagePlus {
            self.b_page_offsets[head + k] = k as u32;
            k += 1;
        }
        self.b_page_offsets[head] = k as u32;
    }

    // free-bit accessors; meaningful only on small pools

    #[inline]
    pub fn freebit_test(&self, biti: usize) -> bool {
        debug_assert!(!self.is_large);
        self.freebits.as_ref().map_or(false, |b| b.test(biti))
    }

    #[inline]
    pub fn freebit_set(&mut self, biti: usize) {
        debug_assert!(!self.is_large);
        if let Some(b) = &mut self.freebits {
            b.set(biti);
        }
    }

    #[inline]
    pub fn freebit_clear(&mut self, biti: usize) {
        debug_assert!(!self.is_large);
        if let Some(b) = &mut self.freebits {
            b.clear(biti);
        }
    }

    // attribute bits

    #[inline]
    pub fn finals_test(&self, biti: usize) -> bool {
        self.finals.as_ref().map_or(false, |b| b.test(biti))
    }

    #[inline]
    pub fn noscan_test(&self, biti: usize) -> bool {
        self.noscan.as_ref().map_or(false, |b| b.test(biti))
    }

    #[inline]
    pub fn nointerior_test(&self, biti: usize) -> bool {
        self.nointerior.as_ref().map_or(false, |b| b.test(biti))
    }

    pub fn get_bits(&self, biti: usize) -> BlkAttr {
        let mut attrs = BlkAttr::empty();
        if self.finals_test(biti) {
            attrs |= BlkAttr::FINALIZE;
        }
        if self.noscan_test(biti) {
            attrs |= BlkAttr::NO_SCAN;
        }
        if self.appendable.as_ref().map_or(false, |b| b.test(biti)) {
            attrs |= BlkAttr::APPENDABLE;
        }
        if self.nointerior_test(biti) {
            attrs |= BlkAttr::NO_INTERIOR;
        }
        attrs
    }

    /// Set the attribute bits of `mask`, allocating planes on first use.
    /// NO_INTERIOR is only tracked on large pools.
    pub fn set_bits(&mut self, biti: usize, mask: BlkAttr) {
        let nbits = self.nbits;
        if mask.contains(BlkAttr::FINALIZE) {
            self.finals.get_or_insert_with(|| Bitset::new(nbits)).set(biti);
        }
        if mask.contains(BlkAttr::NO_SCAN) {
            self.noscan.get_or_insert_with(|| Bitset::new(nbits)).set(biti);
        }
        if mask.contains(BlkAttr::APPENDABLE) {
            self.appendable
                .get_or_insert_with(|| Bitset::new(nbits))
                .set(biti);
        }
        if mask.contains(BlkAttr::NO_INTERIOR) && self.is_large {
            self.nointerior
                .get_or_insert_with(|| Bitset::new(nbits))
                .set(biti);
        }
    }

    pub fn clr_bits(&mut self, biti: usize, mask: BlkAttr) {
        if mask.contains(BlkAttr::FINALIZE) {
            if let Some(b) = &mut self.finals {
                b.clear(biti);
            }
        }
        if mask.contains(BlkAttr::NO_SCAN) {
            if let Some(b) = &mut self.noscan {
                b.clear(biti);
            }
        }
        if mask.contains(BlkAttr::APPENDABLE) {
            if let Some(b) = &mut self.appendable {
                b.clear(biti);
            }
        }
        if mask.contains(BlkAttr::NO_INTERIOR) {
            if let Some(b) = &mut self.nointerior {
                b.clear(biti);
            }
        }
    }

    /// Sweep-time batch clear: drop every attribute bit of `mask_word`
    /// within data word `w`, one store per allocated plane.
    pub fn clr_bits_small_sweep(&mut self, w: usize, mask_word: usize) {
        if let Some(b) = &mut self.finals {
            b.clear_word_bits(w, mask_word);
        }
        if let Some(b) = &mut self.noscan {
            b.clear_word_bits(w, mask_word);
        }
        if let Some(b) = &mut self.appendable {
            b.clear_word_bits(w, mask_word);
        }
        if let Some(b) = &mut self.nointerior {
            b.clear_word_bits(w, mask_word);
        }
    }

    /// Zero the collect-cycle planes ahead of marking.
    pub fn prepare_collect(&mut self) {
        self.mark.zero_all();
        self.scan.zero_all();
        if let Some(fb) = &mut self.freebits {
            fb.zero_all();
        }
        self.new_changes = false;
    }

    /// Pre-mark every free-listed slot so the mark phase treats it as a
    /// non-root and the sweep leaves it alone.
    pub fn seed_mark_from_freebits(&mut self) {
        if let Some(fb) = &self.freebits {
            self.mark.copy_from(fb);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        os::unmap(self.base, self.npages * PAGESIZE);
    }
}
