//! End-to-end collector scenarios. These drive whole alloc/collect/sweep
//! cycles on private heap instances; reclamation tests collect without
//! stack scanning so stale stack words cannot retain garbage.

use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bins::N_SMALL_BINS;
use crate::config::GcConfig;
use crate::heap::Heap;
use crate::pool::{BlkAttr, PAGESIZE};
use crate::threads::{IsMarked, SingleThread, ThreadContext};

const WORD: usize = core::mem::size_of::<usize>();

fn small_heap() -> Heap {
    let config = GcConfig {
        pool_pages: 8,
        ..GcConfig::default()
    };
    Heap::new(&config, Arc::new(SingleThread::new()))
}

#[test]
fn s1_rooted_block_keeps_its_bytes() {
    let mut heap = small_heap();
    let p = heap.malloc(32, BlkAttr::empty()).unwrap();
    unsafe { ptr::write_bytes(p, 0xAB, 32) };
    heap.add_root(p);
    heap.full_collect_no_stack().unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(p, 32) };
    assert!(bytes.iter().all(|&b| b == 0xAB));
    assert_eq!(heap.size_of(p), 32);
}

#[test]
fn s2_zeroed_range_slots_release_their_blocks() {
    let mut heap = small_heap();
    let mut slots: Vec<*mut u8> = Vec::with_capacity(100);
    for _ in 0..100 {
        slots.push(heap.calloc(16, BlkAttr::empty()).unwrap());
    }
    let orig = slots.clone();
    heap.add_range(slots.as_ptr() as *const u8, 100 * WORD);
    for i in (1..100).step_by(2) {
        slots[i] = ptr::null_mut();
    }
    heap.full_collect_no_stack().unwrap();
    for (i, &p) in orig.iter().enumerate() {
        if i % 2 == 0 {
            assert_eq!(heap.find_base(p as usize), p, "even block {} died", i);
        } else {
            assert!(heap.find_base(p as usize).is_null(), "odd block {} survived", i);
        }
    }
}

// S3 (extend over trailing free pages, back-offsets included) is covered in
// the heap module's extend tests.

#[test]
fn s4_minimize_releases_an_emptied_pool() {
    let mut heap = small_heap();
    heap.disable();
    let slot = crate::bins::bin_for_size(16 + crate::sentinel::EXTRA).size();
    let count = 8 * PAGESIZE / slot;
    let mut ptrs = Vec::with_capacity(count);
    for _ in 0..count {
        ptrs.push(heap.malloc(16, BlkAttr::NO_SCAN).unwrap());
    }
    assert_eq!(heap.npools(), 1);
    for &p in &ptrs {
        heap.free(p).unwrap();
    }
    heap.enable();
    heap.full_collect_no_stack().unwrap();
    heap.minimize();
    assert_eq!(heap.npools(), 0);
    assert_eq!(heap.addr_bounds(), (0, 0));
    // idempotent: a second call changes nothing
    heap.minimize();
    assert_eq!(heap.npools(), 0);
    assert_eq!(heap.addr_bounds(), (0, 0));
    assert_eq!(heap.stats().pool_bytes, 0);
}

#[test]
fn s5_nointerior_honors_only_base_pointers() {
    let mut heap = small_heap();
    let b = heap
        .malloc(3 * PAGESIZE, BlkAttr::NO_INTERIOR | BlkAttr::NO_SCAN)
        .unwrap();
    let interior = (b as usize + 16) as *mut u8;
    heap.add_root(interior);
    heap.full_collect_no_stack().unwrap();
    assert!(heap.find_base(b as usize).is_null(), "interior pointer retained the block");
    heap.remove_root(interior);

    let b = heap
        .malloc(3 * PAGESIZE, BlkAttr::NO_INTERIOR | BlkAttr::NO_SCAN)
        .unwrap();
    heap.add_root(b);
    heap.full_collect_no_stack().unwrap();
    assert_eq!(heap.find_base(b as usize), b, "base pointer failed to retain the block");
}

#[test]
fn s6_depth_200_chain_survives_recursion_limit() {
    let mut heap = small_heap();
    let mut nodes = Vec::with_capacity(200);
    for _ in 0..200 {
        nodes.push(heap.calloc(32, BlkAttr::empty()).unwrap());
    }
    for i in 0..199 {
        unsafe { *(nodes[i] as *mut usize) = nodes[i + 1] as usize };
    }
    heap.set_attr(nodes[199], BlkAttr::NO_SCAN);
    heap.add_root(nodes[0]);
    heap.full_collect_no_stack().unwrap();
    for (i, &n) in nodes.iter().enumerate() {
        assert_eq!(heap.find_base(n as usize), n, "node {} was reclaimed", i);
    }
}

#[test]
fn addr_of_identity_across_the_block() {
    let mut heap = small_heap();
    let p = heap.malloc(100, BlkAttr::empty()).unwrap();
    let cap = heap.size_of(p);
    assert!(cap >= 100);
    for k in (0..cap).step_by(WORD) {
        assert_eq!(heap.find_base(p as usize + k), p);
    }
    let q = heap.malloc(2 * PAGESIZE + 10, BlkAttr::empty()).unwrap();
    let qcap = heap.size_of(q);
    for k in (0..qcap).step_by(PAGESIZE / 2) {
        assert_eq!(heap.find_base(q as usize + k), q);
    }
}

#[test]
fn size_of_lower_bound() {
    let mut heap = small_heap();
    for n in [1usize, 15, 16, 17, 100, 2048, 2049, 5000, 3 * PAGESIZE] {
        let p = heap.malloc(n, BlkAttr::NO_SCAN).unwrap();
        assert!(heap.size_of(p) >= n, "size_of({}) too small", n);
    }
    assert_eq!(heap.size_of(ptr::null_mut()), 0);
}

#[test]
fn free_lists_stay_consistent_after_collection() {
    let mut heap = small_heap();
    let mut keep: Vec<*mut u8> = Vec::with_capacity(64);
    for i in 0..256 {
        let size = [24usize, 120, 500, 1000][i % 4];
        let p = heap.calloc(size, BlkAttr::empty()).unwrap();
        if i % 4 == 0 && keep.len() < keep.capacity() {
            keep.push(p);
        }
    }
    heap.add_range(keep.as_ptr() as *const u8, keep.len() * WORD);
    heap.full_collect_no_stack().unwrap();
    for bi in 0..N_SMALL_BINS {
        let mut seen = HashSet::new();
        let mut list = heap.buckets[bi];
        while !list.is_null() {
            assert!(seen.insert(list as usize), "cycle in bucket {}", bi);
            let pi = heap.find_pool(list as usize).expect("free slot outside pools");
            let pool = &heap.pools[pi];
            let pn = (list as usize - pool.base_addr()) / PAGESIZE;
            assert_eq!(pool.pagetable[pn] as usize, bi, "slot on a page of the wrong bin");
            list = unsafe { (*list).next };
        }
    }
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

unsafe fn counting_finalizer(_p: *mut u8, _detached: bool, _reset_mem: bool) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn finalizers_run_for_dead_blocks_only() {
    let config = GcConfig {
        pool_pages: 8,
        finalizer: Some(counting_finalizer),
        ..GcConfig::default()
    };
    let mut heap = Heap::new(&config, Arc::new(SingleThread::new()));
    let _small = heap
        .malloc(48, BlkAttr::FINALIZE | BlkAttr::NO_SCAN)
        .unwrap();
    let _big = heap
        .malloc(3 * PAGESIZE, BlkAttr::FINALIZE | BlkAttr::NO_SCAN)
        .unwrap();
    let live = heap
        .malloc(48, BlkAttr::FINALIZE | BlkAttr::NO_SCAN)
        .unwrap();
    heap.add_root(live);
    let before = FINALIZED.load(Ordering::SeqCst);
    heap.full_collect_no_stack().unwrap();
    assert_eq!(FINALIZED.load(Ordering::SeqCst), before + 2);
}

struct ProbeContext {
    probe: AtomicUsize,
    verdict: parking_lot::Mutex<Option<IsMarked>>,
}

impl ThreadContext for ProbeContext {
    fn scan_all(&self, _scan: &mut dyn FnMut(*const u8, *const u8)) {}

    fn process_marks(&self, is_marked: &mut dyn FnMut(*const u8) -> IsMarked) {
        let p = self.probe.load(Ordering::Relaxed);
        if p != 0 {
            *self.verdict.lock() = Some(is_marked(p as *const u8));
        }
    }
}

#[test]
fn process_marks_sees_final_mark_state() {
    let ctx = Arc::new(ProbeContext {
        probe: AtomicUsize::new(0),
        verdict: parking_lot::Mutex::new(None),
    });
    let config = GcConfig {
        pool_pages: 8,
        ..GcConfig::default()
    };
    let mut heap = Heap::new(&config, ctx.clone());

    let p = heap.malloc(64, BlkAttr::NO_SCAN).unwrap();
    heap.add_root(p);
    ctx.probe.store(p as usize, Ordering::Relaxed);
    heap.full_collect_no_stack().unwrap();
    assert_eq!(*ctx.verdict.lock(), Some(IsMarked::Yes));

    heap.remove_root(p);
    heap.full_collect_no_stack().unwrap();
    assert_eq!(*ctx.verdict.lock(), Some(IsMarked::No));

    let local = 0usize;
    ctx.probe
        .store(&local as *const usize as usize, Ordering::Relaxed);
    heap.full_collect_no_stack().unwrap();
    assert_eq!(*ctx.verdict.lock(), Some(IsMarked::Unknown));
}

#[test]
fn random_stress_keeps_the_heap_consistent() {
    let mut heap = small_heap();
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut live: Vec<(*mut u8, usize)> = Vec::new();
    for round in 0..2000usize {
        let action = rng.gen_range(0..100);
        if action < 55 || live.is_empty() {
            let size = rng.gen_range(1..=9000);
            let p = heap.malloc(size, BlkAttr::NO_SCAN).unwrap();
            assert!(heap.size_of(p) >= size);
            unsafe { ptr::write_bytes(p, (round & 0xFF) as u8, size.min(32)) };
            live.push((p, size));
        } else if action < 80 {
            let i = rng.gen_range(0..live.len());
            let (p, _) = live.swap_remove(i);
            heap.free(p).unwrap();
        } else if action < 95 {
            let i = rng.gen_range(0..live.len());
            let size = rng.gen_range(1..=6000);
            let q = heap.realloc(live[i].0, size, BlkAttr::NO_SCAN).unwrap();
            assert!(heap.size_of(q) >= size);
            live[i] = (q, size);
        } else {
            // nothing is rooted: a collection must reclaim everything
            heap.full_collect_no_stack().unwrap();
            for (p, _) in live.drain(..) {
                assert!(heap.find_base(p as usize).is_null());
            }
        }
        // the pool table stays sorted and disjoint throughout
        for w in heap.pools.windows(2) {
            assert!(w[0].top_addr() <= w[1].base_addr());
        }
    }
}
