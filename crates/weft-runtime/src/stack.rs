//! Fiber stack allocation using mmap
//!
//! Each stack is a private anonymous mapping with a PROT_NONE guard page at
//! the low end, so overflow faults instead of corrupting a neighbour.

use weft_core::{RuntimeConfig, SchedError, SchedResult};

/// An owned, guard-paged fiber stack.
pub struct Stack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

// The mapping is plain memory with no thread affinity.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Allocate a stack of roughly `size` usable bytes.
    ///
    /// `size` 0 selects the configured default; sizes below one page are
    /// clamped up. The usable size is rounded to whole pages and a guard
    /// page is added below it.
    pub fn alloc(size: usize) -> SchedResult<Stack> {
        let page = page_size();
        let size = if size == 0 { RuntimeConfig::get().stack_size } else { size };
        let usable = size.max(page).div_ceil(page) * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SchedError::StackAllocation);
        }

        // Guard page stays PROT_NONE; only the range above it becomes usable.
        let rt = unsafe {
            libc::mprotect(
                (base as *mut u8).add(page) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rt != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(SchedError::StackAllocation);
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
            usable,
        })
    }

    /// Top of the stack (stacks grow down).
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes, excluding the guard page.
    #[inline]
    pub fn len(&self) -> usize {
        self.usable
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.usable == 0
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_default_size() {
        let s = Stack::alloc(0).unwrap();
        assert_eq!(s.len(), RuntimeConfig::get().stack_size);
        assert!(!s.top().is_null());
    }

    #[test]
    fn test_tiny_size_is_clamped() {
        let s = Stack::alloc(1).unwrap();
        assert!(s.len() >= page_size());
    }

    #[test]
    fn test_stack_is_writable_at_top() {
        let s = Stack::alloc(16 * 1024).unwrap();
        unsafe {
            let p = s.top().sub(8);
            p.write_bytes(0xAB, 8);
            assert_eq!(*p, 0xAB);
        }
    }
}
