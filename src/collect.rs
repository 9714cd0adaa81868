//! The collector: a stop-the-world conservative mark-and-sweep cycle over
//! the heap. Marking is two-tier: cheap bounded recursion for shallow
//! graphs, with overflow deferred to per-pool scan bitmaps that are drained
//! word-wise in outer passes.

use log::debug;

use crate::bins::{Bin, N_SMALL_BINS};
use crate::bits::{WORD_MASK, WORD_SHIFT};
use crate::error::GcError;
use crate::heap::{FreeSlot, Heap};
use crate::pool::{BlkAttr, PAGESIZE, SHIFT_SMALL};
use crate::sentinel;
use crate::threads::IsMarked;

/// Mark recursion budget; deeper chains fall back to the scan-bit worklist.
pub const MAX_MARK_RECURSIONS: u32 = 64;

const WORD_SIZE: usize = core::mem::size_of::<usize>();

impl Heap {
    /// Run a full collection: stop the world, mark from roots, ranges and
    /// (unless suppressed) thread stacks, sweep, and rebuild the free
    /// lists. Returns the number of pages freed plus pages recovered.
    pub fn full_collect(&mut self) -> Result<usize, GcError> {
        if self.running {
            return Err(GcError::InvalidMemoryOperation);
        }
        self.running = true;
        let ctx = self.context.clone();
        ctx.suspend_all();

        self.prepare();

        // the root table itself is scanned as an array of candidate pointers
        let roots = std::mem::take(&mut self.roots);
        if !roots.is_empty() {
            let bot = roots.as_ptr() as *const u8;
            let top = unsafe { bot.add(roots.len() * WORD_SIZE) };
            self.mark(bot, top, MAX_MARK_RECURSIONS);
        }
        self.roots = roots;

        if self.no_stack == 0 {
            ctx.scan_all(&mut |bot, top| self.mark(bot, top, MAX_MARK_RECURSIONS));
        }

        let ranges = std::mem::take(&mut self.ranges);
        for r in &ranges {
            self.mark(r.pbot, r.ptop, MAX_MARK_RECURSIONS);
        }
        self.ranges = ranges;

        self.mark_pending();

        ctx.process_marks(&mut |addr| self.is_marked(addr as usize));
        ctx.resume_all();

        let freed = self.sweep();
        let recovered = self.recover();
        self.running = false;
        debug!(
            "collection: {} page(s) freed, {} page(s) recovered, {} pool(s)",
            freed,
            recovered,
            self.npools()
        );
        Ok(freed + recovered)
    }

    /// Like [`full_collect`](Heap::full_collect) but without scanning
    /// thread stacks and registers; only roots and ranges pin memory.
    pub fn full_collect_no_stack(&mut self) -> Result<usize, GcError> {
        self.no_stack += 1;
        let result = self.full_collect();
        self.no_stack -= 1;
        result
    }

    /// Reset per-pool cycle state and pre-mark the free lists.
    fn prepare(&mut self) {
        self.invalidate_caches();
        for pool in &mut self.pools {
            pool.prepare_collect();
        }
        // record every free-listed slot in its pool's freebits
        for bi in 0..N_SMALL_BINS {
            let mut list = self.buckets[bi];
            while !list.is_null() {
                let addr = list as usize;
                let pi = self
                    .find_pool(addr)
                    .expect("free list entry outside any pool");
                let pool = &mut self.pools[pi];
                let biti = (addr - pool.base_addr()) >> SHIFT_SMALL;
                pool.freebit_set(biti);
                list = unsafe { (*list).next };
            }
        }
        // free slots are pre-marked so the scan treats them as non-roots
        for pool in &mut self.pools {
            pool.seed_mark_from_freebits();
        }
    }

    /// Conservatively scan `[pbot, ptop)` as word-aligned candidate
    /// pointers, marking every block they hit. Newly marked scannable
    /// blocks are scanned recursively while `depth` lasts, then deferred
    /// to the scan-bit worklist.
    fn mark(&mut self, pbot: *const u8, ptop: *const u8, depth: u32) {
        let mut p1 = (pbot as usize + WORD_SIZE - 1) & !(WORD_SIZE - 1);
        let p2 = (ptop as usize) & !(WORD_SIZE - 1);
        let mut pcache = 0usize;
        while p1 < p2 {
            let p = unsafe { *(p1 as *const usize) };
            p1 += WORD_SIZE;
            if p < self.min_addr || p >= self.max_addr {
                continue;
            }
            if (p & !(PAGESIZE - 1)) == pcache {
                continue;
            }
            let Some(pi) = self.find_pool(p) else {
                continue;
            };
            let (base, size) = {
                let pool = &mut self.pools[pi];
                let offset = p - pool.base_addr();
                let mut pn = offset / PAGESIZE;
                let bin = pool.pagetable[pn];
                let mut points_to_base = true;
                let (biti, base) = match bin {
                    Bin::Page => {
                        pcache = p & !(PAGESIZE - 1);
                        let base = pool.base_addr() + pn * PAGESIZE;
                        points_to_base = p == base + sentinel::PRE_SIZE;
                        (pn, base)
                    }
                    Bin::PagePlus => {
                        pcache = p & !(PAGESIZE - 1);
                        pn -= pool.b_page_offsets[pn] as usize;
                        points_to_base = false;
                        (pn, pool.base_addr() + pn * PAGESIZE)
                    }
                    Bin::Free => continue,
                    _ => {
                        // small bin: round down to the slot base
                        let off = offset & !(bin.size() - 1);
                        (off >> SHIFT_SMALL, pool.base_addr() + off)
                    }
                };
                if pool.is_large && !points_to_base && pool.nointerior_test(biti) {
                    continue;
                }
                if pool.mark.test_set(biti) || pool.noscan_test(biti) {
                    continue;
                }
                if depth == 0 {
                    // out of recursion budget: defer to the worklist
                    pool.scan.set(biti);
                    pool.new_changes = true;
                    continue;
                }
                let size = if bin.is_small() {
                    bin.size()
                } else {
                    pool.b_page_offsets[pn] as usize * PAGESIZE
                };
                (base, size)
            };
            self.mark(base as *const u8, (base + size) as *const u8, depth - 1);
        }
    }

    /// Drain the scan-bit worklists to a fixpoint. Each pass snapshots the
    /// per-pool change flags, then walks flagged pools' scan planes a word
    /// at a time, bit-scan-forward over each word, re-entering `mark` with
    /// a fresh budget per pending object.
    fn mark_pending(&mut self) {
        loop {
            let mut any = false;
            for pool in &mut self.pools {
                pool.old_changes = pool.new_changes;
                if pool.new_changes {
                    any = true;
                }
                pool.new_changes = false;
            }
            if !any {
                break;
            }
            for pi in 0..self.pools.len() {
                if !self.pools[pi].old_changes {
                    continue;
                }
                let nwords = self.pools[pi].scan.nwords();
                for w in 0..nwords {
                    let mut bitm = {
                        let words = self.pools[pi].scan.data_mut();
                        let m = words[w];
                        words[w] = 0;
                        m
                    };
                    while bitm != 0 {
                        let b = bitm.trailing_zeros() as usize;
                        bitm &= bitm - 1;
                        let biti = (w << WORD_SHIFT) | b;
                        let (base, size) = {
                            let pool = &self.pools[pi];
                            let offset = biti << pool.shift;
                            let pn = offset / PAGESIZE;
                            match pool.pagetable[pn] {
                                Bin::Page => (
                                    pool.base_addr() + pn * PAGESIZE,
                                    pool.b_page_offsets[pn] as usize * PAGESIZE,
                                ),
                                Bin::PagePlus | Bin::Free => {
                                    unreachable!("scan bit on a non-head page")
                                }
                                bin => (pool.base_addr() + offset, bin.size()),
                            }
                        };
                        self.mark(base as *const u8, (base + size) as *const u8, MAX_MARK_RECURSIONS);
                    }
                }
            }
        }
    }

    /// Mark verdict for an address, as relayed to suspended threads.
    pub(crate) fn is_marked(&self, p: usize) -> IsMarked {
        let Some(pi) = self.find_pool(p) else {
            return IsMarked::Unknown;
        };
        let pool = &self.pools[pi];
        let offset = p - pool.base_addr();
        let pn = offset / PAGESIZE;
        let biti = match pool.pagetable[pn] {
            Bin::Page => pn,
            Bin::PagePlus => pn - pool.b_page_offsets[pn] as usize,
            Bin::Free => return IsMarked::No,
            bin => (offset & !(bin.size() - 1)) >> SHIFT_SMALL,
        };
        if pool.mark.test(biti) {
            IsMarked::Yes
        } else {
            IsMarked::No
        }
    }

    /// Reclaim unmarked blocks. Large pools free whole page runs; small
    /// pools flip dead slots to free bits, batching the attribute clears
    /// one bitset word at a time. Returns pages freed from large blocks.
    fn sweep(&mut self) -> usize {
        let fin = self.finalizer;
        let mut freedpages = 0;
        let mut freed_small = 0usize;
        for pool in &mut self.pools {
            if pool.is_large {
                let mut pn = 0;
                while pn < pool.npages {
                    if pool.pagetable[pn] == Bin::Page && !pool.mark.test(pn) {
                        let npages = pool.b_page_offsets[pn] as usize;
                        if pool.finals_test(pn) {
                            if let Some(f) = fin {
                                let client = unsafe {
                                    sentinel::client((pool.base_addr() + pn * PAGESIZE) as *mut u8)
                                };
                                unsafe { f(client, false, false) };
                            }
                        }
                        pool.clr_bits(pn, BlkAttr::all());
                        pool.free_pages(pn, npages);
                        freedpages += npages;
                        pn += npages;
                    } else {
                        pn += 1;
                    }
                }
            } else {
                for pn in 0..pool.npages {
                    let bin = pool.pagetable[pn];
                    if !bin.is_small() {
                        continue;
                    }
                    let bin_size = bin.size();
                    let bit_base = pn * (PAGESIZE >> SHIFT_SMALL);
                    let stride = bin_size >> SHIFT_SMALL;
                    let mut clear_word = usize::MAX;
                    let mut clear_mask = 0usize;
                    for k in 0..PAGESIZE / bin_size {
                        let biti = bit_base + k * stride;
                        if pool.mark.test(biti) {
                            continue; // live, or already on the free list
                        }
                        if pool.finals_test(biti) {
                            if let Some(f) = fin {
                                let client = unsafe {
                                    sentinel::client(
                                        (pool.base_addr() + pn * PAGESIZE + k * bin_size)
                                            as *mut u8,
                                    )
                                };
                                unsafe { f(client, false, false) };
                            }
                        }
                        pool.freebit_set(biti);
                        let w = biti >> WORD_SHIFT;
                        if w != clear_word {
                            if clear_word != usize::MAX {
                                pool.clr_bits_small_sweep(clear_word, clear_mask);
                            }
                            clear_word = w;
                            clear_mask = 0;
                        }
                        clear_mask |= 1usize << (biti & WORD_MASK);
                        freed_small += bin_size;
                    }
                    if clear_word != usize::MAX {
                        pool.clr_bits_small_sweep(clear_word, clear_mask);
                    }
                }
            }
        }
        if freed_small > 0 {
            debug!("sweep reclaimed {} small-object bytes", freed_small);
        }
        freedpages
    }

    /// Rebuild the free lists from the free bits, demoting fully-free
    /// pages back to the page allocator. Returns pages recovered.
    fn recover(&mut self) -> usize {
        let mut buckets: [*mut FreeSlot; N_SMALL_BINS] = [core::ptr::null_mut(); N_SMALL_BINS];
        let mut recovered = 0;
        for pool in &mut self.pools {
            if pool.is_large {
                continue;
            }
            for pn in 0..pool.npages {
                let bin = pool.pagetable[pn];
                if !bin.is_small() {
                    continue;
                }
                let bin_size = bin.size();
                let nslots = PAGESIZE / bin_size;
                let bit_base = pn * (PAGESIZE >> SHIFT_SMALL);
                let stride = bin_size >> SHIFT_SMALL;
                if (0..nslots).all(|k| pool.freebit_test(bit_base + k * stride)) {
                    pool.pagetable[pn] = Bin::Free;
                    pool.freepages += 1;
                    if pn < pool.search_start {
                        pool.search_start = pn;
                    }
                    recovered += 1;
                    continue;
                }
                let page_base = pool.base_addr() + pn * PAGESIZE;
                let bi = bin as usize;
                for k in 0..nslots {
                    if pool.freebit_test(bit_base + k * stride) {
                        let slot = (page_base + k * bin_size) as *mut FreeSlot;
                        unsafe {
                            // skip the write when the link is already right
                            if (*slot).next != buckets[bi] {
                                (*slot).next = buckets[bi];
                            }
                        }
                        buckets[bi] = slot;
                    }
                }
            }
        }
        self.buckets = buckets;
        recovered
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;
    use crate::heap::tests::test_heap;

    #[test]
    fn unreachable_small_block_is_swept() {
        let mut heap = test_heap();
        let p = heap.malloc(64, BlkAttr::NO_SCAN).unwrap();
        let reclaimed = heap.full_collect_no_stack().unwrap();
        assert!(reclaimed >= 1); // the block's page was recovered
        assert!(heap.find_base(p as usize).is_null());
    }

    #[test]
    fn rooted_block_survives_with_contents_and_attrs() {
        let mut heap = test_heap();
        let p = heap.malloc(32, BlkAttr::empty()).unwrap();
        unsafe { ptr::write_bytes(p, 0xAB, 32) };
        heap.set_attr(p, BlkAttr::APPENDABLE);
        heap.add_root(p);
        heap.full_collect_no_stack().unwrap();
        assert_eq!(heap.size_of(p), 32);
        let bytes = unsafe { std::slice::from_raw_parts(p, 32) };
        assert!(bytes.iter().all(|&b| b == 0xAB));
        assert_eq!(heap.get_attr(p), BlkAttr::APPENDABLE);
    }

    #[test]
    fn unreachable_large_block_pages_return_to_pool() {
        let mut heap = test_heap();
        let p = heap.malloc(3 * PAGESIZE, BlkAttr::NO_SCAN).unwrap();
        let npages = heap.find_size(p as usize) / PAGESIZE;
        let pi = heap.find_pool(p as usize).unwrap();
        let free_before = heap.pools[pi].freepages;
        let reclaimed = heap.full_collect_no_stack().unwrap();
        assert!(reclaimed >= npages);
        assert!(heap.find_base(p as usize).is_null());
        assert_eq!(heap.pools[pi].freepages, free_before + npages);
    }

    #[test]
    fn interior_pointer_keeps_large_block_alive() {
        let mut heap = test_heap();
        let p = heap.malloc(3 * PAGESIZE, BlkAttr::empty()).unwrap();
        heap.add_root((p as usize + 2 * PAGESIZE + 100) as *mut u8);
        heap.full_collect_no_stack().unwrap();
        assert_eq!(heap.find_base(p as usize), p);
    }

    #[test]
    fn marking_follows_heap_pointers() {
        let mut heap = test_heap();
        // a -> b, only a is rooted; both must survive
        let a = heap.calloc(64, BlkAttr::empty()).unwrap();
        let b = heap.calloc(64, BlkAttr::empty()).unwrap();
        unsafe { *(a as *mut usize) = b as usize };
        heap.add_root(a);
        heap.full_collect_no_stack().unwrap();
        assert_eq!(heap.find_base(a as usize), a);
        assert_eq!(heap.find_base(b as usize), b);
    }

    #[test]
    fn noscan_bodies_are_not_traced() {
        let mut heap = test_heap();
        let a = heap.calloc(64, BlkAttr::empty()).unwrap();
        let b = heap.calloc(64, BlkAttr::empty()).unwrap();
        unsafe { *(a as *mut usize) = b as usize };
        heap.set_attr(a, BlkAttr::NO_SCAN);
        heap.add_root(a);
        heap.full_collect_no_stack().unwrap();
        assert_eq!(heap.find_base(a as usize), a);
        assert!(heap.find_base(b as usize).is_null());
    }

    #[test]
    fn collect_is_rejected_while_running() {
        let mut heap = test_heap();
        heap.running = true;
        assert_eq!(heap.full_collect(), Err(GcError::InvalidMemoryOperation));
        heap.running = false;
    }
}
