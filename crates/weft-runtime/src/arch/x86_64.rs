//! x86_64 context switching implementation
//!
//! Uses naked inline assembly, stable in Rust 1.88+.

use std::arch::naked_asm;

/// Callee-saved register set per the System V AMD64 ABI, plus the stack
/// pointer and resume address.
///
/// Field order is fixed: the assembly below addresses fields by byte offset.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn new() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fresh context.
///
/// Sets up the registers so that when switched to, execution begins in the
/// trampoline, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` must be the
/// top of a live stack mapping.
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    // 16-byte aligned per the System V AMD64 ABI: the trampoline is entered
    // by a jump, so its `call` leaves the entry function with the standard
    // rsp % 16 == 8 frame.
    let aligned_sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function never returns; `ud2` traps if it somehow does.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Perform a context switch.
///
/// Saves the callee-saved registers into `save` and loads the set from
/// `restore`, transferring control to `restore`'s resume address. When some
/// later switch restores `save`, control returns to this call's return point.
///
/// # Safety
///
/// Both pointers must reference valid `Context` memory; `restore` must hold a
/// context previously produced by `init_context` or an earlier save.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _restore: *const Context) {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from restore (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
