//! Fiber identifiers

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of unique fiber ids, process-wide and monotonically increasing.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a fiber.
///
/// Id 0 is reserved for "no fiber".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    /// The "no fiber" sentinel.
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next unique id.
    pub fn next() -> FiberId {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = FiberId::next();
        let b = FiberId::next();
        let c = FiberId::next();
        assert!(a.as_u64() < b.as_u64());
        assert!(b.as_u64() < c.as_u64());
        assert!(!a.is_none());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(FiberId::NONE.is_none());
        assert_eq!(FiberId::NONE.as_u64(), 0);
    }
}
