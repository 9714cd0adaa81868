//! Public collector interface: one heap serialized by a re-entrant mutex.
//! Using a process-wide static directly would be unsafe in Rust, so hosts
//! either go through [`global()`] or own a [`Gc`] instance themselves.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::ReentrantMutex;

use crate::config::GcConfig;
use crate::error::GcError;
use crate::heap::{BlkInfo, GcStats, Heap};
use crate::pool::BlkAttr;
use crate::threads::{SingleThread, ThreadContext};

/// The collector. Every operation takes the one lock; a reentrant caller
/// (a finalizer calling back into the allocator) acquires it again on the
/// same thread and is then bounced by the heap's `running` guard instead
/// of deadlocking.
pub struct Gc {
    lock: ReentrantMutex<()>,
    heap: UnsafeCell<Heap>,
}

unsafe impl Send for Gc {}
unsafe impl Sync for Gc {}

static GLOBAL: Lazy<Gc> = Lazy::new(|| {
    let config = GcConfig::from_env().expect("invalid collector configuration");
    Gc::new(config, Arc::new(SingleThread::new()))
});

/// The process-wide collector, configured from the environment on first
/// use, with single-threaded stack scanning.
pub fn global() -> &'static Gc {
    &GLOBAL
}

impl Gc {
    pub fn new(config: GcConfig, context: Arc<dyn ThreadContext>) -> Gc {
        Gc {
            lock: ReentrantMutex::new(()),
            heap: UnsafeCell::new(Heap::new(&config, context)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        let _guard = self.lock.lock();
        f(unsafe { &mut *self.heap.get() })
    }

    /// Re-enable automatic collections; pairs with [`disable`](Gc::disable).
    pub fn enable(&self) {
        self.with(|h| h.enable())
    }

    /// Suppress automatic collections. Nests; allocation falls through to
    /// pool growth until every `disable` is matched by an `enable`.
    pub fn disable(&self) {
        self.with(|h| h.disable())
    }

    pub fn malloc(&self, size: usize, attrs: BlkAttr) -> Result<*mut u8, GcError> {
        self.with(|h| h.malloc(size, attrs))
    }

    pub fn calloc(&self, size: usize, attrs: BlkAttr) -> Result<*mut u8, GcError> {
        self.with(|h| h.calloc(size, attrs))
    }

    pub fn realloc(&self, p: *mut u8, size: usize, attrs: BlkAttr) -> Result<*mut u8, GcError> {
        self.with(|h| h.realloc(p, size, attrs))
    }

    /// Grow a large block in place; see the heap-level contract. Returns
    /// the new total byte capacity, or 0 when nothing changed.
    pub fn extend(&self, p: *mut u8, minsize: usize, maxsize: usize) -> Result<usize, GcError> {
        self.with(|h| h.extend(p, minsize, maxsize))
    }

    /// Pre-map heap memory; returns the bytes reserved (0 on failure).
    pub fn reserve(&self, size: usize) -> Result<usize, GcError> {
        self.with(|h| h.reserve(size))
    }

    pub fn free(&self, p: *mut u8) -> Result<(), GcError> {
        self.with(|h| h.free(p))
    }

    /// Base address of the block containing `p`; null for foreign
    /// pointers and free slots.
    pub fn addr_of(&self, p: *mut u8) -> *mut u8 {
        if p.is_null() {
            return ptr::null_mut();
        }
        self.with(|h| h.find_base(p as usize))
    }

    /// Capacity of the block at `p`; 0 for null and foreign pointers.
    pub fn size_of(&self, p: *mut u8) -> usize {
        self.with(|h| h.size_of(p))
    }

    /// Base, capacity and attributes of the block containing `p`.
    pub fn query(&self, p: *mut u8) -> BlkInfo {
        if p.is_null() {
            return BlkInfo::null();
        }
        self.with(|h| h.get_info(p as usize))
    }

    /// Assert the consistency of the block at `p`; violations are fatal.
    pub fn check(&self, p: *mut u8) {
        self.with(|h| h.check(p))
    }

    pub fn get_attr(&self, p: *mut u8) -> BlkAttr {
        self.with(|h| h.get_attr(p))
    }

    /// Returns the attributes in place before the change.
    pub fn set_attr(&self, p: *mut u8, mask: BlkAttr) -> BlkAttr {
        self.with(|h| h.set_attr(p, mask))
    }

    /// Returns the attributes in place before the change.
    pub fn clr_attr(&self, p: *mut u8, mask: BlkAttr) -> BlkAttr {
        self.with(|h| h.clr_attr(p, mask))
    }

    pub fn add_root(&self, p: *mut u8) {
        self.with(|h| h.add_root(p))
    }

    pub fn remove_root(&self, p: *mut u8) {
        self.with(|h| h.remove_root(p))
    }

    /// Visit every registered root under the lock.
    pub fn root_iter(&self, f: &mut dyn FnMut(*mut u8)) {
        self.with(|h| {
            for &root in h.roots() {
                f(root);
            }
        })
    }

    pub fn add_range(&self, p: *const u8, size: usize) {
        self.with(|h| h.add_range(p, size))
    }

    pub fn remove_range(&self, p: *const u8) {
        self.with(|h| h.remove_range(p))
    }

    /// Visit every registered range under the lock.
    pub fn range_iter(&self, f: &mut dyn FnMut(*const u8, *const u8)) {
        self.with(|h| {
            for r in h.ranges() {
                f(r.pbot, r.ptop);
            }
        })
    }

    /// Run a full collection; returns the number of pages reclaimed.
    pub fn full_collect(&self) -> Result<usize, GcError> {
        self.with(|h| h.full_collect())
    }

    /// Collect without scanning thread stacks and registers.
    pub fn full_collect_no_stack(&self) -> Result<usize, GcError> {
        self.with(|h| h.full_collect_no_stack())
    }

    /// Return fully-free pools to the OS.
    pub fn minimize(&self) {
        self.with(|h| h.minimize())
    }

    pub fn stats(&self) -> GcStats {
        self.with(|h| h.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PAGESIZE;

    fn small_gc() -> Gc {
        let config = GcConfig {
            pool_pages: 8,
            ..GcConfig::default()
        };
        Gc::new(config, Arc::new(SingleThread::new()))
    }

    #[test]
    fn global_singleton_roundtrip() {
        let gc = global();
        let p = gc.malloc(100, BlkAttr::empty()).unwrap();
        assert!(!p.is_null());
        assert!(gc.size_of(p) >= 100);
        let info = gc.query(p);
        assert_eq!(info.base, p);
        gc.check(p);
        gc.free(p).unwrap();
    }

    #[test]
    fn api_collects_unrooted_blocks() {
        let gc = small_gc();
        let p = gc.malloc(64, BlkAttr::NO_SCAN).unwrap();
        let freed = gc.full_collect_no_stack().unwrap();
        assert!(freed >= 1);
        assert!(gc.addr_of(p).is_null());
        gc.minimize();
        assert_eq!(gc.stats().pool_bytes, 0);
    }

    #[test]
    fn roots_and_ranges_iterate_under_lock() {
        let gc = small_gc();
        let p = gc.malloc(32, BlkAttr::empty()).unwrap();
        gc.add_root(p);
        let buf = [0u8; 64];
        gc.add_range(buf.as_ptr(), buf.len());
        let mut roots = Vec::new();
        gc.root_iter(&mut |r| roots.push(r));
        assert_eq!(roots, vec![p]);
        let mut ranges = Vec::new();
        gc.range_iter(&mut |bot, top| ranges.push((bot, top)));
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].0, buf.as_ptr());
        gc.remove_root(p);
        gc.remove_range(buf.as_ptr());
        let mut n = 0;
        gc.root_iter(&mut |_| n += 1);
        gc.range_iter(&mut |_, _| n += 1);
        assert_eq!(n, 0);
    }

    #[test]
    fn disable_nests_and_reserve_grows() {
        let gc = small_gc();
        gc.disable();
        gc.disable();
        let got = gc.reserve(4 * PAGESIZE).unwrap();
        assert!(got >= 4 * PAGESIZE);
        gc.enable();
        gc.enable();
    }
}
