//! Optional allocation guards (cargo feature `sentinel`). Each block is
//! prefixed with `{requested size, 0xF4..}` and suffixed with a single
//! `0xF5` byte, verified on free and check. Without the feature every
//! helper collapses to a no-op and `EXTRA`/`PRE_SIZE` are zero.

#[cfg(feature = "sentinel")]
mod imp {
    use core::mem;

    /// Bytes added in front of the client data: stored size + pre guard.
    pub const PRE_SIZE: usize = 2 * mem::size_of::<usize>();
    /// Total per-allocation overhead.
    pub const EXTRA: usize = PRE_SIZE + 1;

    const PRE: usize = usize::from_ne_bytes([0xF4; mem::size_of::<usize>()]);
    const POST: u8 = 0xF5;

    /// Lay the guards into a raw block of `req + EXTRA` bytes and return
    /// the client pointer.
    pub unsafe fn wrap(block: *mut u8, req: usize) -> *mut u8 {
        let words = block as *mut usize;
        words.write(req);
        words.add(1).write(PRE);
        let client = block.add(PRE_SIZE);
        client.add(req).write(POST);
        client
    }

    /// Client pointer of a guarded block.
    pub unsafe fn client(block: *mut u8) -> *mut u8 {
        block.add(PRE_SIZE)
    }

    /// Block base of a client pointer.
    pub unsafe fn block_base(client: *mut u8) -> *mut u8 {
        client.sub(PRE_SIZE)
    }

    /// Size the client originally requested.
    pub unsafe fn stored_size(client: *mut u8) -> usize {
        (client.sub(PRE_SIZE) as *const usize).read()
    }

    /// Verify both guards; a torn guard means a heap over- or underrun.
    pub unsafe fn check(client: *mut u8) {
        let words = client.sub(PRE_SIZE) as *const usize;
        let req = words.read();
        assert_eq!(words.add(1).read(), PRE, "sentinel underrun at {client:p}");
        assert_eq!(client.add(req).read(), POST, "sentinel overrun at {client:p}");
    }
}

#[cfg(not(feature = "sentinel"))]
mod imp {
    pub const PRE_SIZE: usize = 0;
    pub const EXTRA: usize = 0;

    #[inline(always)]
    pub unsafe fn wrap(block: *mut u8, _req: usize) -> *mut u8 {
        block
    }

    #[inline(always)]
    pub unsafe fn client(block: *mut u8) -> *mut u8 {
        block
    }

    #[inline(always)]
    pub unsafe fn block_base(client: *mut u8) -> *mut u8 {
        client
    }

    #[inline(always)]
    pub unsafe fn check(_client: *mut u8) {}
}

pub use imp::*;
