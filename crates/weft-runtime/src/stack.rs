//! Guard-paged fiber stacks
//!
//! Each task fiber gets its own mmap'ed region with a PROT_NONE guard
//! page at the low end, so a stack overflow faults instead of silently
//! corrupting a neighbour.

use std::sync::OnceLock;

use weft_core::error::{RtError, RtResult};

/// One fiber stack: `[guard page][usable stack ...]`, stack grows down
/// toward the guard.
pub struct FiberStack {
    base: *mut u8,
    total: usize,
    guard: usize,
}

// The region is owned by exactly one fiber and only its running thread
// touches it.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a stack of at least `size` usable bytes (rounded up to whole
    /// pages) plus one guard page.
    pub fn alloc(size: usize) -> RtResult<FiberStack> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RtError::os("mmap"));
        }

        // Guard page at the low end stays PROT_NONE; overflow hits it.
        let rt = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rt != 0 {
            let err = RtError::os("mprotect");
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        Ok(FiberStack {
            base: base as *mut u8,
            total,
            guard: page,
        })
    }

    /// High end of the stack, the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (excluding the guard page)
    #[inline]
    pub fn size(&self) -> usize {
        self.total - self.guard
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let rt = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if rt != 0 {
            tracing::warn!(
                err = %std::io::Error::last_os_error(),
                "munmap of fiber stack failed"
            );
        }
    }
}

/// System page size, cached after the first query
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_top() {
        let stack = FiberStack::alloc(128 * 1024).unwrap();
        assert!(stack.size() >= 128 * 1024);
        assert_eq!(stack.top() as usize % page_size(), 0);
        // The whole usable range must be writable.
        unsafe {
            let top = stack.top();
            *top.sub(1) = 0xAB;
            *top.sub(stack.size()) = 0xCD;
        }
    }

    #[test]
    fn test_rounds_up_to_page() {
        let stack = FiberStack::alloc(1).unwrap();
        assert_eq!(stack.size(), page_size());
    }
}
