use thiserror::Error;

/// Errors surfaced by the public allocator entry points.
///
/// Foreign and null pointers are not errors; per the API contract they are
/// silently ignored by `free`, `addr_of`, `size_of` and `query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GcError {
    /// The retry ladder exhausted a collection and a pool growth attempt
    /// without producing a free block.
    #[error("out of memory")]
    OutOfMemory,
    /// An allocator entry point was re-entered while a collection is in
    /// progress, e.g. from a finalizer.
    #[error("invalid memory operation")]
    InvalidMemoryOperation,
}
