//! Fiber state type

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Runnable: newly created, reset, or yielded mid-execution
    Ready = 1,

    /// Currently executing on some thread
    Running = 2,

    /// Entry function returned; may be reused via reset
    Term = 3,
}

impl FiberState {
    /// Check if this state allows the fiber to be resumed
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has finished execution
    #[inline]
    pub const fn is_term(&self) -> bool {
        matches!(self, FiberState::Term)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Term,
            _ => FiberState::Ready, // Default for invalid values
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for s in [FiberState::Ready, FiberState::Running, FiberState::Term] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
    }

    #[test]
    fn test_predicates() {
        assert!(FiberState::Ready.is_resumable());
        assert!(!FiberState::Running.is_resumable());
        assert!(FiberState::Term.is_term());
        assert!(!FiberState::Ready.is_term());
    }
}
