//! x86_64 context switching implementation
//!
//! Uses inline assembly for the context switch.
//! Stable in Rust 1.88+

use std::arch::naked_asm;

/// Callee-saved register set for a suspended fiber
///
/// Field order is load-bearing: the assembly below addresses fields by
/// byte offset.
#[repr(C)]
pub struct SavedContext {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedContext {
    pub const fn zeroed() -> Self {
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

/// Prime a fresh fiber context
///
/// Sets up the register image so that switching to it enters the
/// trampoline, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `ctx` must point to valid `SavedContext` memory and `stack_top` to the
/// high end of a mapped stack region (16-byte alignable).
#[inline]
pub unsafe fn init_context(
    ctx: *mut SavedContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // Stack must be 16-byte aligned per System V AMD64 ABI; the extra -8
    // matches the alignment state after a `call`.
    let sp = stack_top as usize;
    let aligned_sp = (sp & !0xF) - 8;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64; // Entry function
    ctx.r13 = entry_arg as u64; // Entry argument
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument
///
/// The entry function terminates the fiber itself (it marks the final
/// state and switches away), so control never falls through the call.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2",);
}

/// Perform a cooperative context switch
///
/// Saves callee-saved registers to `old_ctx` and loads from `new_ctx`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(
    _old_ctx: *mut SavedContext,
    _new_ctx: *const SavedContext,
) {
    naked_asm!(
        // Save callee-saved registers to old_ctx (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_ctx (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
