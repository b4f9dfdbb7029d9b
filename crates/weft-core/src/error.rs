//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Fiber stack mmap/mprotect failed
    StackAllocation,

    /// Creating the readiness poller failed (errno)
    PollerCreate(i32),

    /// Registering / modifying / removing a descriptor in the poller failed (errno)
    PollerCtl(i32),

    /// Creating the wakeup pipe failed (errno)
    PipeCreate(i32),

    /// Invalid runtime configuration
    InvalidConfig(&'static str),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::StackAllocation => write!(f, "fiber stack allocation failed"),
            SchedError::PollerCreate(errno) => write!(f, "poller creation failed (errno {})", errno),
            SchedError::PollerCtl(errno) => write!(f, "poller control failed (errno {})", errno),
            SchedError::PipeCreate(errno) => write!(f, "wakeup pipe creation failed (errno {})", errno),
            SchedError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for SchedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::StackAllocation;
        assert_eq!(format!("{}", e), "fiber stack allocation failed");

        let e = SchedError::PollerCtl(9);
        assert_eq!(format!("{}", e), "poller control failed (errno 9)");
    }
}
