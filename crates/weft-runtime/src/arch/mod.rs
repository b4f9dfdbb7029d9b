//! Architecture-specific context switching
//!
//! Each architecture module provides:
//!
//! - `Context`: the callee-saved register set plus stack pointer and resume
//!   program counter, `repr(C)` so the assembly can address fields by offset
//! - `init_context`: seed a context so the first switch into it enters the
//!   trampoline, which hands the stashed argument to the entry function
//! - `context_switch`: save the current callee-saved set into one context
//!   and restore the other, transferring control
//!
//! The entry function must never return through the trampoline; fibers leave
//! by switching out one final time.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use x86_64::{context_switch, init_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub use aarch64::{context_switch, init_context, Context};
    }
}
