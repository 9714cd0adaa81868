//! The heap: address-sorted pool table, size-class free lists, the
//! allocation fast paths and the retry ladder that drives collection and
//! pool growth when they run dry.

use std::ptr;
use std::sync::Arc;

use log::debug;

use crate::bins::{bin_for_size, Bin, BIN_SIZE, MAX_SMALL_SIZE, N_SMALL_BINS};
use crate::config::{FinalizeFn, GcConfig};
use crate::error::GcError;
use crate::pool::{BlkAttr, Pool, PAGESIZE, SHIFT_SMALL};
use crate::sentinel;
use crate::threads::ThreadContext;

/// Free-list node threaded through unused small slots.
#[repr(C)]
pub(crate) struct FreeSlot {
    pub next: *mut FreeSlot,
}

/// Registered conservative scan range `[pbot, ptop)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AddrRange {
    pub pbot: *const u8,
    pub ptop: *const u8,
}

/// Result of a block query: allocation base, capacity (page-rounded for
/// large blocks) and the current attribute mask.
#[derive(Clone, Copy, Debug)]
pub struct BlkInfo {
    pub base: *mut u8,
    pub size: usize,
    pub attr: BlkAttr,
}

impl BlkInfo {
    pub(crate) fn null() -> BlkInfo {
        BlkInfo {
            base: ptr::null_mut(),
            size: 0,
            attr: BlkAttr::empty(),
        }
    }
}

/// Point-in-time heap accounting.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcStats {
    /// Total bytes mapped in pools.
    pub pool_bytes: usize,
    /// Bytes of small-bin pages minus the free-listed bytes on them.
    pub used_bytes: usize,
    /// Bytes currently threaded on small free lists.
    pub free_list_bytes: usize,
    /// Pages currently free across all pools.
    pub free_pages: usize,
    /// Pages heading a large block.
    pub page_blocks: usize,
}

pub struct Heap {
    /// Pools, strictly ordered by base address and disjoint.
    pub(crate) pools: Vec<Box<Pool>>,
    pub(crate) min_addr: usize,
    pub(crate) max_addr: usize,
    /// Free-list heads, one per small bin.
    pub(crate) buckets: [*mut FreeSlot; N_SMALL_BINS],
    pub(crate) roots: Vec<*mut u8>,
    pub(crate) ranges: Vec<AddrRange>,
    /// Nesting count of `disable` calls; automatic collections run at zero.
    pub(crate) disabled: u32,
    /// Nesting count of stack-scan suppression across a collection.
    pub(crate) no_stack: u32,
    /// A collection is in progress; allocator entry points must bounce.
    pub(crate) running: bool,
    pub(crate) pool_pages: usize,
    pub(crate) finalizer: Option<FinalizeFn>,
    pub(crate) context: Arc<dyn ThreadContext>,
    // one-entry lookup caches, keyed by probed address
    cache_size_key: usize,
    cache_size_val: usize,
    cache_info_key: usize,
    cache_info_val: BlkInfo,
}

impl Heap {
    pub fn new(config: &GcConfig, context: Arc<dyn ThreadContext>) -> Heap {
        Heap {
            pools: Vec::new(),
            min_addr: 0,
            max_addr: 0,
            buckets: [ptr::null_mut(); N_SMALL_BINS],
            roots: Vec::with_capacity(16),
            ranges: Vec::with_capacity(16),
            disabled: config.start_disabled as u32,
            no_stack: 0,
            running: false,
            pool_pages: config.pool_pages,
            finalizer: config.finalizer,
            context,
            cache_size_key: usize::MAX,
            cache_size_val: 0,
            cache_info_key: usize::MAX,
            cache_info_val: BlkInfo::null(),
        }
    }

    #[inline]
    pub fn npools(&self) -> usize {
        self.pools.len()
    }

    #[inline]
    pub fn addr_bounds(&self) -> (usize, usize) {
        (self.min_addr, self.max_addr)
    }

    pub fn enable(&mut self) {
        assert!(self.disabled > 0, "enable without a matching disable");
        self.disabled -= 1;
    }

    pub fn disable(&mut self) {
        self.disabled += 1;
    }

    /// Pool owning `p`, by binary search over the sorted table.
    pub(crate) fn find_pool(&self, p: usize) -> Option<usize> {
        if p < self.min_addr || p >= self.max_addr {
            return None;
        }
        let i = self.pools.partition_point(|pool| pool.top_addr() <= p);
        if i < self.pools.len() && self.pools[i].contains(p) {
            Some(i)
        } else {
            None
        }
    }

    pub(crate) fn invalidate_caches(&mut self) {
        self.cache_size_key = usize::MAX;
        self.cache_info_key = usize::MAX;
    }

    /// Refresh the caches after an in-place size change of the block at `p`.
    fn update_caches(&mut self, p: usize, size: usize) {
        if self.cache_size_key == p {
            self.cache_size_val = size;
        }
        if self.cache_info_key == p {
            self.cache_info_val.size = size - sentinel::EXTRA;
        }
    }

    // ------------------------------------------------------------------
    // allocation

    pub fn malloc(&mut self, size: usize, attrs: BlkAttr) -> Result<*mut u8, GcError> {
        if self.running {
            return Err(GcError::InvalidMemoryOperation);
        }
        if size == 0 {
            return Ok(ptr::null_mut());
        }
        if size + sentinel::EXTRA <= MAX_SMALL_SIZE {
            self.small_alloc(size, attrs)
        } else {
            self.big_alloc(size, attrs)
        }
    }

    pub fn calloc(&mut self, size: usize, attrs: BlkAttr) -> Result<*mut u8, GcError> {
        let p = self.malloc(size, attrs)?;
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, size) };
        }
        Ok(p)
    }

    fn small_alloc(&mut self, size: usize, attrs: BlkAttr) -> Result<*mut u8, GcError> {
        let alloc_size = size + sentinel::EXTRA;
        let bin = bin_for_size(alloc_size);
        let bi = bin as usize;

        let mut state = if self.disabled > 0 { 1u32 } else { 0 };
        let mut collected = false;
        while self.buckets[bi].is_null() && !self.alloc_page(bin) {
            match state {
                0 => {
                    let freed = self.full_collect()?;
                    collected = true;
                    if freed < self.pools.len() * (self.pool_pages / 8) {
                        // the cycle barely paid for itself; grow instead of
                        // collecting again
                        self.new_pool(1, false);
                        state = 2;
                    } else {
                        state = 1;
                    }
                }
                1 => {
                    self.new_pool(1, false);
                    state = 2;
                }
                _ => {
                    // a disabled heap goes OOM rather than collecting anyway
                    if collected || self.disabled > 0 {
                        return Err(GcError::OutOfMemory);
                    }
                    state = 0;
                }
            }
        }

        let slot = self.buckets[bi];
        unsafe {
            self.buckets[bi] = (*slot).next;
        }
        let addr = slot as usize;
        let pi = self
            .find_pool(addr)
            .expect("free list entry outside any pool");
        let pool = &mut self.pools[pi];
        let biti = pool.bit_index(addr);
        pool.freebit_clear(biti);
        if !attrs.is_empty() {
            pool.set_bits(biti, attrs);
        }
        unsafe {
            if !attrs.contains(BlkAttr::NO_SCAN) {
                // zero the slack so stale words in it cannot retain garbage
                ptr::write_bytes((slot as *mut u8).add(alloc_size), 0, bin.size() - alloc_size);
            }
            Ok(sentinel::wrap(slot as *mut u8, size))
        }
    }

    fn big_alloc(&mut self, size: usize, attrs: BlkAttr) -> Result<*mut u8, GcError> {
        let alloc_size = size + sentinel::EXTRA;
        let npages = (alloc_size + PAGESIZE - 1) / PAGESIZE;

        let mut state = if self.disabled > 0 { 1u32 } else { 0 };
        let mut collected = false;
        let (pi, pn) = loop {
            if let Some(hit) = self.alloc_big_pages(npages) {
                break hit;
            }
            match state {
                0 => {
                    let freed = self.full_collect()?;
                    collected = true;
                    if freed < self.pools.len() * (self.pool_pages / 4) {
                        self.minimize();
                        self.new_pool(npages, true);
                        state = 2;
                    } else {
                        state = 1;
                    }
                }
                1 => {
                    self.minimize();
                    self.new_pool(npages, true);
                    state = 2;
                }
                _ => {
                    // a disabled heap goes OOM rather than collecting anyway
                    if collected || self.disabled > 0 {
                        return Err(GcError::OutOfMemory);
                    }
                    state = 0;
                }
            }
        };

        let pool = &mut self.pools[pi];
        pool.pagetable[pn] = Bin::Page;
        for k in 1..npages {
            pool.pagetable[pn + k] = Bin::PagePlus;
        }
        pool.update_offsets(pn);
        pool.freepages -= npages;
        if !attrs.is_empty() {
            pool.set_bits(pn, attrs);
        }
        let block = (pool.base_addr() + pn * PAGESIZE) as *mut u8;
        unsafe {
            if !attrs.contains(BlkAttr::NO_SCAN) {
                ptr::write_bytes(block.add(alloc_size), 0, npages * PAGESIZE - alloc_size);
            }
            Ok(sentinel::wrap(block, size))
        }
    }

    /// Promote one free page of a small pool into a run of `bin` blocks on
    /// its free list. False when no small pool has a free page left.
    fn alloc_page(&mut self, bin: Bin) -> bool {
        let mut found = None;
        for (i, pool) in self.pools.iter_mut().enumerate() {
            if pool.is_large {
                continue;
            }
            if let Some(pn) = pool.alloc_pages(1) {
                found = Some((i, pn));
                break;
            }
        }
        let Some((pi, pn)) = found else {
            return false;
        };
        let pool = &mut self.pools[pi];
        pool.pagetable[pn] = bin;
        pool.freepages -= 1;

        let bin_size = bin.size();
        let page_base = pool.base_addr() + pn * PAGESIZE;
        let bit_base = pn * (PAGESIZE >> SHIFT_SMALL);
        let stride = bin_size >> SHIFT_SMALL;
        let bi = bin as usize;
        let mut head = self.buckets[bi];
        for k in 0..PAGESIZE / bin_size {
            pool.freebit_set(bit_base + k * stride);
            let slot = (page_base + k * bin_size) as *mut FreeSlot;
            unsafe {
                (*slot).next = head;
            }
            head = slot;
        }
        self.buckets[bi] = head;
        true
    }

    fn alloc_big_pages(&mut self, npages: usize) -> Option<(usize, usize)> {
        for (i, pool) in self.pools.iter_mut().enumerate() {
            if !pool.is_large || pool.freepages < npages {
                continue;
            }
            if let Some(pn) = pool.alloc_pages(npages) {
                return Some((i, pn));
            }
        }
        None
    }

    /// Map a new pool and splice it into the sorted table. `None` when the
    /// OS refuses the mapping.
    fn new_pool(&mut self, npages: usize, is_large: bool) -> Option<usize> {
        let quantum = self.pool_pages;
        let mut npages = npages;
        if npages < quantum {
            npages = quantum;
        } else {
            // oversized request: 150% headroom for later in-place extension
            npages += npages / 2;
        }
        // successive pools scale with the heap, capped at 32 quanta
        if !self.pools.is_empty() {
            let scaled = self.pools.len().min(32) * quantum;
            if npages < scaled {
                npages = scaled;
            }
        }
        let pool = Box::new(Pool::new(npages, is_large)?);
        debug!(
            "new {} pool: {} pages at {:#x}",
            if is_large { "large" } else { "small" },
            npages,
            pool.base_addr()
        );
        let pos = self
            .pools
            .partition_point(|q| q.base_addr() < pool.base_addr());
        self.pools.insert(pos, pool);
        self.refresh_addr_bounds();
        Some(pos)
    }

    pub(crate) fn refresh_addr_bounds(&mut self) {
        if self.pools.is_empty() {
            self.min_addr = 0;
            self.max_addr = 0;
        } else {
            self.min_addr = self.pools[0].base_addr();
            self.max_addr = self.pools[self.pools.len() - 1].top_addr();
        }
    }

    /// Pre-map a small pool covering at least `size` bytes; returns the
    /// bytes reserved, 0 on failure.
    pub fn reserve(&mut self, size: usize) -> Result<usize, GcError> {
        if self.running {
            return Err(GcError::InvalidMemoryOperation);
        }
        if size == 0 {
            return Ok(0);
        }
        let npages = (size + PAGESIZE - 1) / PAGESIZE;
        match self.new_pool(npages, false) {
            Some(pi) => Ok(self.pools[pi].npages * PAGESIZE),
            None => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // free / realloc / extend

    pub fn free(&mut self, p: *mut u8) -> Result<(), GcError> {
        if self.running {
            return Err(GcError::InvalidMemoryOperation);
        }
        if p.is_null() {
            return Ok(());
        }
        let addr = p as usize;
        let Some(pi) = self.find_pool(addr) else {
            return Ok(()); // not ours
        };
        let pool = &mut self.pools[pi];
        let block = unsafe { sentinel::block_base(p) } as usize;
        let offset = block - pool.base_addr();
        let pn = offset / PAGESIZE;
        match pool.pagetable[pn] {
            Bin::Page => {
                unsafe { sentinel::check(p) };
                let npages = pool.b_page_offsets[pn] as usize;
                pool.clr_bits(pn, BlkAttr::all());
                pool.free_pages(pn, npages);
            }
            Bin::PagePlus | Bin::Free => {} // interior or stale pointer
            bin => {
                let slot_off = offset & !(bin.size() - 1);
                let biti = slot_off >> SHIFT_SMALL;
                if pool.freebit_test(biti) {
                    return Ok(()); // already on the free list
                }
                unsafe { sentinel::check(p) };
                pool.clr_bits(biti, BlkAttr::all());
                pool.freebit_set(biti);
                let slot = (pool.base_addr() + slot_off) as *mut FreeSlot;
                let bi = bin as usize;
                unsafe {
                    (*slot).next = self.buckets[bi];
                }
                self.buckets[bi] = slot;
            }
        }
        if self.cache_size_key == addr || self.cache_info_key == addr {
            self.invalidate_caches();
        }
        Ok(())
    }

    pub fn realloc(
        &mut self,
        p: *mut u8,
        size: usize,
        attrs: BlkAttr,
    ) -> Result<*mut u8, GcError> {
        if self.running {
            return Err(GcError::InvalidMemoryOperation);
        }
        if p.is_null() {
            return self.malloc(size, attrs);
        }
        if size == 0 {
            self.free(p)?;
            return Ok(ptr::null_mut());
        }
        let addr = p as usize;
        let cur = self.find_size(addr);
        if cur == 0 {
            return self.malloc(size, attrs); // not ours
        }
        let alloc_size = size + sentinel::EXTRA;

        #[cfg(not(feature = "sentinel"))]
        if cur >= PAGESIZE && alloc_size > MAX_SMALL_SIZE {
            // both old and new size span whole pages; resize in place
            if let Some(q) = self.resize_big_in_place(addr, cur, alloc_size, attrs) {
                return Ok(q);
            }
        }

        // guarded blocks always move so the guards land at the new size
        if cfg!(feature = "sentinel") || alloc_size > cur || cur > 2 * alloc_size {
            let q = self.malloc(size, attrs)?;
            let keep = size.min(cur - sentinel::EXTRA);
            unsafe {
                ptr::copy_nonoverlapping(p, q, keep);
            }
            self.free(p)?;
            Ok(q)
        } else {
            // close enough: keep the block, report the old capacity
            if !attrs.is_empty() {
                self.reset_attrs(addr, attrs);
            }
            Ok(p)
        }
    }

    /// Shrink or grow a large block without moving it. `None` means the
    /// caller must fall back to copying.
    #[cfg_attr(feature = "sentinel", allow(dead_code))]
    fn resize_big_in_place(
        &mut self,
        p: usize,
        cur: usize,
        want: usize,
        attrs: BlkAttr,
    ) -> Option<*mut u8> {
        let psz = cur / PAGESIZE;
        let newsz = (want + PAGESIZE - 1) / PAGESIZE;
        let pi = self.find_pool(p)?;
        let pool = &mut self.pools[pi];
        if !pool.is_large {
            return None;
        }
        let pn = (p - pool.base_addr()) / PAGESIZE;
        if pool.pagetable[pn] != Bin::Page {
            return None; // interior pointer
        }
        if newsz == psz {
            if !attrs.is_empty() {
                pool.clr_bits(pn, BlkAttr::all());
                pool.set_bits(pn, attrs);
            }
            return Some(p as *mut u8);
        }
        if newsz < psz {
            pool.free_pages(pn + newsz, psz - newsz);
            pool.b_page_offsets[pn] = newsz as u32;
        } else {
            if pn + newsz > pool.npages
                || pool.pagetable[pn + psz..pn + newsz]
                    .iter()
                    .any(|&b| b != Bin::Free)
            {
                return None;
            }
            for k in psz..newsz {
                pool.pagetable[pn + k] = Bin::PagePlus;
            }
            pool.freepages -= newsz - psz;
            pool.update_offsets(pn);
        }
        if !attrs.is_empty() {
            pool.clr_bits(pn, BlkAttr::all());
            pool.set_bits(pn, attrs);
        }
        self.update_caches(p, newsz * PAGESIZE);
        Some(p as *mut u8)
    }

    /// Grow a large block in place by claiming trailing free pages, up to
    /// `maxsize` bytes but no fewer than `minsize`. Returns the new total
    /// byte capacity, or 0 when the block cannot grow (state unchanged).
    pub fn extend(&mut self, p: *mut u8, minsize: usize, maxsize: usize) -> Result<usize, GcError> {
        if self.running {
            return Err(GcError::InvalidMemoryOperation);
        }
        if p.is_null() || cfg!(feature = "sentinel") {
            return Ok(0);
        }
        let addr = p as usize;
        let Some(pi) = self.find_pool(addr) else {
            return Ok(0);
        };
        let pool = &mut self.pools[pi];
        if !pool.is_large {
            return Ok(0);
        }
        let pn = (addr - pool.base_addr()) / PAGESIZE;
        if pool.pagetable[pn] != Bin::Page {
            return Ok(0);
        }
        let psz = pool.b_page_offsets[pn] as usize;
        let minsz = (minsize + PAGESIZE - 1) / PAGESIZE;
        let maxsz = (maxsize + PAGESIZE - 1) / PAGESIZE;
        let mut sz = 0;
        while sz < maxsz
            && pn + psz + sz < pool.npages
            && pool.pagetable[pn + psz + sz] == Bin::Free
        {
            sz += 1;
        }
        if sz == 0 || sz < minsz {
            return Ok(0);
        }
        for k in 0..sz {
            pool.pagetable[pn + psz + k] = Bin::PagePlus;
        }
        pool.freepages -= sz;
        pool.update_offsets(pn);
        let new_size = (psz + sz) * PAGESIZE;
        self.update_caches(addr, new_size);
        Ok(new_size)
    }

    // ------------------------------------------------------------------
    // queries

    /// Allocation base of the block containing `p`, or null for foreign
    /// pointers and free slots.
    pub fn find_base(&self, p: usize) -> *mut u8 {
        let Some(pi) = self.find_pool(p) else {
            return ptr::null_mut();
        };
        let pool = &self.pools[pi];
        let offset = p - pool.base_addr();
        let pn = offset / PAGESIZE;
        match pool.pagetable[pn] {
            Bin::Page => unsafe { sentinel::client((pool.base_addr() + pn * PAGESIZE) as *mut u8) },
            Bin::PagePlus => {
                let head = pn - pool.b_page_offsets[pn] as usize;
                unsafe { sentinel::client((pool.base_addr() + head * PAGESIZE) as *mut u8) }
            }
            Bin::Free => ptr::null_mut(),
            bin => {
                let slot_off = offset & !(bin.size() - 1);
                if pool.freebit_test(slot_off >> SHIFT_SMALL) {
                    return ptr::null_mut();
                }
                unsafe { sentinel::client((pool.base_addr() + slot_off) as *mut u8) }
            }
        }
    }

    /// Capacity in bytes of the block containing `p` (sentinel overhead
    /// included), 0 for foreign or interior-of-large pointers.
    pub(crate) fn find_size(&mut self, p: usize) -> usize {
        if p == self.cache_size_key {
            return self.cache_size_val;
        }
        let Some(pi) = self.find_pool(p) else {
            return 0;
        };
        let pool = &self.pools[pi];
        let offset = p - pool.base_addr();
        let pn = offset / PAGESIZE;
        let size = match pool.pagetable[pn] {
            Bin::Page => pool.b_page_offsets[pn] as usize * PAGESIZE,
            Bin::PagePlus | Bin::Free => 0,
            bin => bin.size(),
        };
        if size != 0 {
            self.cache_size_key = p;
            self.cache_size_val = size;
        }
        size
    }

    /// Client-visible capacity of the block at `p`; 0 for null and foreign
    /// pointers.
    pub fn size_of(&mut self, p: *mut u8) -> usize {
        if p.is_null() {
            return 0;
        }
        #[cfg(feature = "sentinel")]
        {
            if self.find_pool(p as usize).is_none() {
                return 0;
            }
            unsafe { sentinel::stored_size(p) }
        }
        #[cfg(not(feature = "sentinel"))]
        {
            self.find_size(p as usize)
        }
    }

    /// Base, capacity and attributes of the block containing `p`.
    pub fn get_info(&mut self, p: usize) -> BlkInfo {
        if p == self.cache_info_key {
            return self.cache_info_val;
        }
        let Some(pi) = self.find_pool(p) else {
            return BlkInfo::null();
        };
        let pool = &self.pools[pi];
        let offset = p - pool.base_addr();
        let pn = offset / PAGESIZE;
        let (base_off, size, biti) = match pool.pagetable[pn] {
            Bin::Page => (
                pn * PAGESIZE,
                pool.b_page_offsets[pn] as usize * PAGESIZE,
                pn,
            ),
            Bin::PagePlus => {
                let head = pn - pool.b_page_offsets[pn] as usize;
                (
                    head * PAGESIZE,
                    pool.b_page_offsets[head] as usize * PAGESIZE,
                    head,
                )
            }
            Bin::Free => return BlkInfo::null(),
            bin => {
                let slot_off = offset & !(bin.size() - 1);
                let biti = slot_off >> SHIFT_SMALL;
                if pool.freebit_test(biti) {
                    return BlkInfo::null();
                }
                (slot_off, bin.size(), biti)
            }
        };
        let info = BlkInfo {
            base: unsafe { sentinel::client((pool.base_addr() + base_off) as *mut u8) },
            size: size - sentinel::EXTRA,
            attr: pool.get_bits(biti),
        };
        self.cache_info_key = p;
        self.cache_info_val = info;
        info
    }

    /// Sanity-check a block pointer; violations are fatal.
    pub fn check(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        unsafe { sentinel::check(p) };
        let addr = p as usize;
        let pi = self
            .find_pool(addr)
            .expect("pointer not owned by the collector");
        let pool = &self.pools[pi];
        let block = unsafe { sentinel::block_base(p) } as usize;
        let offset = block - pool.base_addr();
        let pn = offset / PAGESIZE;
        let bin = pool.pagetable[pn];
        assert!(
            bin == Bin::Page || bin.is_small(),
            "pointer does not reference a block base"
        );
        if bin.is_small() {
            assert_eq!(offset & (bin.size() - 1), 0, "pointer is not a block base");
            let mut list = self.buckets[bin as usize];
            while !list.is_null() {
                assert!(list as usize != block, "block is on its free list");
                list = unsafe { (*list).next };
            }
        }
    }

    // ------------------------------------------------------------------
    // attributes

    /// Pool and bit index of the block containing `p`, resolving interior
    /// pointers to the block head.
    fn block_bit_index(&self, p: usize) -> Option<(usize, usize)> {
        let pi = self.find_pool(p)?;
        let pool = &self.pools[pi];
        let offset = unsafe { sentinel::block_base(p as *mut u8) } as usize - pool.base_addr();
        let pn = offset / PAGESIZE;
        match pool.pagetable[pn] {
            Bin::Page => Some((pi, pn)),
            Bin::PagePlus => Some((pi, pn - pool.b_page_offsets[pn] as usize)),
            Bin::Free => None,
            bin => Some((pi, (offset & !(bin.size() - 1)) >> SHIFT_SMALL)),
        }
    }

    pub fn get_attr(&mut self, p: *mut u8) -> BlkAttr {
        if p.is_null() {
            return BlkAttr::empty();
        }
        match self.block_bit_index(p as usize) {
            Some((pi, biti)) => self.pools[pi].get_bits(biti),
            None => BlkAttr::empty(),
        }
    }

    /// Set attribute bits; returns the attributes before the change.
    pub fn set_attr(&mut self, p: *mut u8, mask: BlkAttr) -> BlkAttr {
        if p.is_null() {
            return BlkAttr::empty();
        }
        match self.block_bit_index(p as usize) {
            Some((pi, biti)) => {
                let pool = &mut self.pools[pi];
                let old = pool.get_bits(biti);
                pool.set_bits(biti, mask);
                old
            }
            None => BlkAttr::empty(),
        }
    }

    /// Clear attribute bits; returns the attributes before the change.
    pub fn clr_attr(&mut self, p: *mut u8, mask: BlkAttr) -> BlkAttr {
        if p.is_null() {
            return BlkAttr::empty();
        }
        match self.block_bit_index(p as usize) {
            Some((pi, biti)) => {
                let pool = &mut self.pools[pi];
                let old = pool.get_bits(biti);
                pool.clr_bits(biti, mask);
                old
            }
            None => BlkAttr::empty(),
        }
    }

    fn reset_attrs(&mut self, p: usize, attrs: BlkAttr) {
        if let Some((pi, biti)) = self.block_bit_index(p) {
            let pool = &mut self.pools[pi];
            pool.clr_bits(biti, BlkAttr::all());
            pool.set_bits(biti, attrs);
        }
    }

    // ------------------------------------------------------------------
    // roots and ranges

    pub fn add_root(&mut self, p: *mut u8) {
        if !p.is_null() {
            self.roots.push(p);
        }
    }

    /// Remove a registered root; unknown roots are silently ignored.
    pub fn remove_root(&mut self, p: *mut u8) {
        if let Some(i) = self.roots.iter().position(|&r| r == p) {
            self.roots.remove(i);
        }
    }

    pub fn roots(&self) -> &[*mut u8] {
        &self.roots
    }

    pub fn add_range(&mut self, pbot: *const u8, size: usize) {
        if !pbot.is_null() && size > 0 {
            self.ranges.push(AddrRange {
                pbot,
                ptop: unsafe { pbot.add(size) },
            });
        }
    }

    /// Remove a registered range by its base; unknown bases are silently
    /// ignored (a benign cross-thread cleanup is indistinguishable from a
    /// bug here).
    pub fn remove_range(&mut self, pbot: *const u8) {
        if let Some(i) = self.ranges.iter().position(|r| r.pbot == pbot) {
            self.ranges.remove(i);
        }
    }

    pub fn ranges(&self) -> &[AddrRange] {
        &self.ranges
    }

    // ------------------------------------------------------------------
    // pool release and accounting

    /// Release every fully-free pool back to the OS. Used pools keep their
    /// relative order.
    pub fn minimize(&mut self) {
        let before = self.pools.len();
        self.pools.retain(|pool| pool.freepages != pool.npages);
        if self.pools.len() != before {
            debug!("minimize released {} pool(s)", before - self.pools.len());
            self.refresh_addr_bounds();
            self.invalidate_caches();
        }
    }

    pub fn stats(&self) -> GcStats {
        let mut stats = GcStats::default();
        let mut small_bytes = 0;
        for pool in &self.pools {
            stats.pool_bytes += pool.npages * PAGESIZE;
            for &bin in pool.pagetable.iter() {
                match bin {
                    Bin::Free => stats.free_pages += 1,
                    Bin::Page => stats.page_blocks += 1,
                    Bin::PagePlus => {}
                    _ => small_bytes += PAGESIZE,
                }
            }
        }
        for bi in 0..N_SMALL_BINS {
            let mut list = self.buckets[bi];
            while !list.is_null() {
                stats.free_list_bytes += BIN_SIZE[bi];
                list = unsafe { (*list).next };
            }
        }
        stats.used_bytes = small_bytes - stats.free_list_bytes;
        stats
    }
}
