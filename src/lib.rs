//! A conservative, stop-the-world, mark-and-sweep garbage collector.
//!
//! The heap is a set of page-aligned pools: small pools serve eight
//! fixed size classes (16..2048 bytes) out of per-bin free lists, large
//! pools serve multi-page blocks tracked through a per-pool page table.
//! A collection suspends the world through the host's threading hooks,
//! conservatively scans registered roots, ranges and thread stacks for
//! candidate pointers, marks reachable blocks (bounded recursion with a
//! scan-bitmap worklist for deep graphs), then sweeps dead blocks back
//! onto the free lists and returns whole pages to their pools.
//!
//! Hosts go through [`global()`] or own a [`Gc`] instance; every entry
//! point is serialized by one re-entrant lock.

#[cfg(test)]
mod tests;

mod bins;
mod bits;
mod collect;
mod config;
mod error;
mod gc;
mod heap;
mod os;
mod pool;
mod sentinel;
mod threads;

pub use collect::MAX_MARK_RECURSIONS;
pub use config::{ConfigError, FinalizeFn, GcConfig};
pub use error::GcError;
pub use gc::{global, Gc};
pub use heap::{AddrRange, BlkInfo, GcStats};
pub use pool::{BlkAttr, PAGESIZE};
pub use threads::{IsMarked, SingleThread, ThreadContext};
