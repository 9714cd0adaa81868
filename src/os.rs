//! Thin wrapper over the OS page mapper. Pools obtain their backing memory
//! here and return it on destruction; nothing else in the crate maps memory.

use core::ptr;
use std::ptr::NonNull;

/// Map `nbytes` of zeroed, page-aligned memory. Returns `None` when the OS
/// refuses the mapping.
pub fn map(nbytes: usize) -> Option<NonNull<u8>> {
    debug_assert!(nbytes > 0);
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            nbytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(p as *mut u8)
}

/// Unmap a region previously obtained from [`map`].
pub fn unmap(base: NonNull<u8>, nbytes: usize) {
    let rc = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, nbytes) };
    debug_assert_eq!(rc, 0, "munmap failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_is_page_aligned_and_zeroed() {
        let n = 4096 * 4;
        let base = map(n).expect("mmap failed");
        assert_eq!(base.as_ptr() as usize % 4096, 0);
        let bytes = unsafe { std::slice::from_raw_parts(base.as_ptr(), n) };
        assert!(bytes.iter().all(|&b| b == 0));
        unmap(base, n);
    }
}
