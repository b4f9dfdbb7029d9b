//! # weft-core
//!
//! Platform-independent types shared by the weft fiber runtime:
//!
//! - Fiber states and ids
//! - I/O event bitmask
//! - Error types
//! - Process-wide runtime configuration

pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod state;

pub use config::RuntimeConfig;
pub use error::{SchedError, SchedResult};
pub use event::Event;
pub use id::FiberId;
pub use state::FiberState;
