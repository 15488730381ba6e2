/*
 * Page-Fault Upcall Plumbing
 *
 * The kernel delivers user page faults by pushing a UTrapframe onto the
 * exception stack and transferring to a registered entry point. The naked
 * entry below calls the installed Rust handler, then resumes the faulting
 * code without kernel help: it stages the trap-time rip on the trap-time
 * stack (using the scratch word the kernel leaves on re-entry), restores
 * every register, switches stacks, and returns.
 */

use crate::env::PushRegs;
use crate::layout::{PGSIZE, PTE_P, PTE_U, PTE_W, UXSTACKTOP};
use crate::syscall::{sys_env_set_pgfault_upcall, sys_page_alloc};

/// The record the kernel pushes onto the exception stack.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UTrapframe {
    pub fault_va: u64,
    pub err: u64,
    pub regs: PushRegs,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

/// Page-fault error code: the access was a write.
pub const FEC_WR: u64 = 1 << 1;

static mut HANDLER: Option<fn(&mut UTrapframe)> = None;

/// Install `handler` as this environment's page-fault handler. The first
/// call allocates the exception stack and registers the assembly entry
/// with the kernel.
pub fn set_pgfault_handler(handler: fn(&mut UTrapframe)) {
    unsafe {
        if HANDLER.is_none() {
            let r = sys_page_alloc(0, UXSTACKTOP - PGSIZE, PTE_P | PTE_U | PTE_W);
            if r < 0 {
                panic!("set_pgfault_handler: exception stack allocation failed ({})", r);
            }
            let r = sys_env_set_pgfault_upcall(0, _pgfault_upcall as usize as u64);
            if r < 0 {
                panic!("set_pgfault_handler: upcall registration failed ({})", r);
            }
        }
        HANDLER = Some(handler);
    }
}

#[unsafe(no_mangle)]
extern "C" fn _pgfault_trampoline(utf: *mut UTrapframe) {
    let handler = unsafe { HANDLER }.expect("page fault with no handler installed");
    handler(unsafe { &mut *utf });
}

/// Assembly entry the kernel jumps to, with rsp at the UTrapframe.
///
/// UTrapframe offsets: fault_va 0, err 8, regs 16, rip 136, rflags 144,
/// rsp 152.
#[unsafe(naked)]
pub extern "C" fn _pgfault_upcall() -> ! {
    core::arch::naked_asm!(
        // Call the Rust handler with the UTrapframe as argument.
        "mov rdi, rsp",
        "call {trampoline}",
        // Resume: stage the trap-time rip just below the trap-time rsp.
        // On a recursive fault that slot is the scratch word the kernel
        // left between the frames.
        "mov rax, [rsp + 136]",
        "mov rbx, [rsp + 152]",
        "sub rbx, 8",
        "mov [rbx], rax",
        "mov [rsp + 152], rbx",
        // Discard fault_va and err, restore the general registers.
        "add rsp, 16",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Skip rip (already staged), restore rflags, switch stacks, go.
        "add rsp, 8",
        "popfq",
        "pop rsp",
        "ret",
        trampoline = sym _pgfault_trampoline,
    );
}
