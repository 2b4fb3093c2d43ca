use std::ptr::NonNull;

//TODO support over-aligned blocks through posix_memalign

/// A source of raw, untyped memory blocks for a collector.
///
/// # Safety
///
/// Every block handed out by `alloc`, `alloc_zeroed` or `realloc` must be
/// readable for its full requested size and aligned for `usize`, because the
/// collector reads block bodies word by word while marking. A block must stay
/// valid until it is passed to `free` or moved by a successful `realloc`.
pub unsafe trait RawAlloc {
    /// Allocates `size` uninitialized bytes, or `None` when exhausted.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Allocates `count * size` zeroed bytes, or `None` when exhausted or when
    /// the product overflows.
    fn alloc_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>>;

    /// Resizes the block at `ptr` to `size` bytes, which is never zero.
    ///
    /// On `None` the original block is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block from this allocator.
    unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// Returns the block at `ptr` to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block from this allocator and must not be used
    /// afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>);
}

unsafe impl<A: RawAlloc + ?Sized> RawAlloc for &A {
    #[inline]
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        (**self).alloc(size)
    }

    #[inline]
    fn alloc_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        (**self).alloc_zeroed(count, size)
    }

    #[inline]
    unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        (**self).realloc(ptr, size)
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>) {
        (**self).free(ptr)
    }
}

/// The platform C allocator.
///
/// Zero-byte requests are rounded up to one byte so every successful
/// allocation has a unique address.
#[derive(Debug, Default, Clone, Copy)]
pub struct Malloc;

unsafe impl RawAlloc for Malloc {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let addr = unsafe { libc::malloc(size.max(1)) };
        NonNull::new(addr as *mut u8)
    }

    fn alloc_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let addr = if bytes == 0 {
            unsafe { libc::calloc(1, 1) }
        } else {
            unsafe { libc::calloc(count, size) }
        };
        NonNull::new(addr as *mut u8)
    }

    unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size > 0, "zero-sized realloc must be a free");

        let addr = libc::realloc(ptr.as_ptr() as *mut libc::c_void, size);
        NonNull::new(addr as *mut u8)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        libc::free(ptr.as_ptr() as *mut libc::c_void);
    }
}
