//! Page mapping for zone chunks.

use std::ptr::NonNull;

#[cfg(unix)]
mod sys {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const MAP_PRIVATE: i32 = 0x02;
    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(not(target_os = "linux"))]
    pub const MAP_ANON: i32 = 0x1000;
    pub const MAP_FAILED: isize = -1;

    // from libc
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Maps `size` bytes of zeroed, page aligned memory. `None` when the kernel
/// refuses the mapping.
#[cfg(unix)]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: a fresh private anonymous mapping aliases nothing
    let ptr = unsafe {
        sys::mmap(
            core::ptr::null_mut(),
            size,
            sys::PROT_READ | sys::PROT_WRITE,
            sys::MAP_PRIVATE | sys::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr as isize == sys::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr.cast())
}

/// # Safety
/// `ptr` and `size` must come from a single [`map_memory`] call and the
/// region must not be used afterwards.
#[cfg(unix)]
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: the caller hands back a whole mapping from map_memory
    let rc = unsafe { sys::munmap(ptr.as_ptr().cast(), size) };
    debug_assert_eq!(rc, 0, "munmap of {size} bytes at {ptr:p} failed");
}

#[cfg(not(unix))]
fn page_layout(size: usize) -> Option<std::alloc::Layout> {
    std::alloc::Layout::from_size_align(size, OS_PAGE_SIZE).ok()
}

#[cfg(not(unix))]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    let layout = page_layout(size)?;
    // SAFETY: zone chunks are never zero sized
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
}

/// # Safety
/// `ptr` and `size` must come from a single [`map_memory`] call and the
/// region must not be used afterwards.
#[cfg(not(unix))]
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    if let Some(layout) = page_layout(size) {
        // SAFETY: allocated by map_memory with the same layout
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
