/*
 * Trap Handling
 *
 * Every IDT gate points at a tiny naked stub that normalises the stack into
 * a Trapframe (error code, then trap number, then all general registers) and
 * jumps to the common dispatcher. Returning to user mode restores a saved
 * Trapframe wholesale and executes iretq, so the Trapframe layout here must
 * match the save/restore sequences in `alltraps` and `env_pop_tf` exactly.
 *
 * Kernel-mode execution is serialised by the big kernel lock: the dispatcher
 * takes it on every entry from user mode (or when waking from the idle halt
 * loop) and `env_run` drops it immediately before iretq.
 */

use core::sync::atomic::Ordering;

use x86_64::registers::control::Cr2;

use crate::arch::x86_64::lapic;
use crate::cpu::{self, CPU_HALTED, CPU_STARTED};
use crate::env::{self, EnvStatus};
use crate::memory::address_space::user_mem_check;
use crate::memory::layout::{PGSIZE, UXSTACKTOP};
use crate::memory::paging::PteFlags;
use crate::spinlock::lock_kernel;
use crate::{console, cprintln, sched, syscall};

// Trap numbers. 0-31 are processor exceptions, 32-47 are mapped IRQs, 48 is
// the system-call gate; everything else funnels into the catch-all.
pub const T_DIVIDE: u64 = 0;
pub const T_DEBUG: u64 = 1;
pub const T_NMI: u64 = 2;
pub const T_BRKPT: u64 = 3;
pub const T_OFLOW: u64 = 4;
pub const T_BOUND: u64 = 5;
pub const T_ILLOP: u64 = 6;
pub const T_DEVICE: u64 = 7;
pub const T_DBLFLT: u64 = 8;
pub const T_TSS: u64 = 10;
pub const T_SEGNP: u64 = 11;
pub const T_STACK: u64 = 12;
pub const T_GPFLT: u64 = 13;
pub const T_PGFLT: u64 = 14;
pub const T_FPERR: u64 = 16;
pub const T_ALIGN: u64 = 17;
pub const T_MCHK: u64 = 18;
pub const T_SIMDERR: u64 = 19;
pub const T_SYSCALL: u64 = 48;
pub const T_DEFAULT: u64 = 500;

pub const IRQ_OFFSET: u64 = 32;
pub const IRQ_TIMER: u64 = 0;
pub const IRQ_SERIAL: u64 = 4;
pub const IRQ_SPURIOUS: u64 = 7;

/// Page-fault error code bits
pub const FEC_PR: u64 = 1 << 0;
pub const FEC_WR: u64 = 1 << 1;
pub const FEC_U: u64 = 1 << 2;

/// General-purpose registers in the order `alltraps` pushes them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PushRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// Full snapshot of user state, laid out so that fifteen register pops, a
/// 16-byte skip, and iretq restore it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub trapno: u64,
    pub errcode: u64,
    // Pushed by hardware:
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Trapframe {
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// The record pushed onto the user exception stack for a page-fault upcall.
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

// Entry stubs. The CPU pushes an error code for some exceptions; the stubs
// for the rest push a zero so the Trapframe shape is uniform.

macro_rules! trap_stub {
    ($name:ident, $num:expr) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() -> ! {
            core::arch::naked_asm!(
                "push 0",
                "push {num}",
                "jmp {alltraps}",
                num = const $num,
                alltraps = sym alltraps,
            );
        }
    };
    ($name:ident, $num:expr, errcode) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() -> ! {
            core::arch::naked_asm!(
                "push {num}",
                "jmp {alltraps}",
                num = const $num,
                alltraps = sym alltraps,
            );
        }
    };
}

trap_stub!(t_divide, T_DIVIDE);
trap_stub!(t_debug, T_DEBUG);
trap_stub!(t_nmi, T_NMI);
trap_stub!(t_brkpt, T_BRKPT);
trap_stub!(t_oflow, T_OFLOW);
trap_stub!(t_bound, T_BOUND);
trap_stub!(t_illop, T_ILLOP);
trap_stub!(t_device, T_DEVICE);
trap_stub!(t_dblflt, T_DBLFLT, errcode);
trap_stub!(t_tss, T_TSS, errcode);
trap_stub!(t_segnp, T_SEGNP, errcode);
trap_stub!(t_stack, T_STACK, errcode);
trap_stub!(t_gpflt, T_GPFLT, errcode);
trap_stub!(t_pgflt, T_PGFLT, errcode);
trap_stub!(t_fperr, T_FPERR);
trap_stub!(t_align, T_ALIGN, errcode);
trap_stub!(t_mchk, T_MCHK);
trap_stub!(t_simderr, T_SIMDERR);
trap_stub!(t_syscall, T_SYSCALL);
trap_stub!(t_default, T_DEFAULT);

trap_stub!(t_irq0, IRQ_OFFSET + 0);
trap_stub!(t_irq1, IRQ_OFFSET + 1);
trap_stub!(t_irq2, IRQ_OFFSET + 2);
trap_stub!(t_irq3, IRQ_OFFSET + 3);
trap_stub!(t_irq4, IRQ_OFFSET + 4);
trap_stub!(t_irq5, IRQ_OFFSET + 5);
trap_stub!(t_irq6, IRQ_OFFSET + 6);
trap_stub!(t_irq7, IRQ_OFFSET + 7);
trap_stub!(t_irq8, IRQ_OFFSET + 8);
trap_stub!(t_irq9, IRQ_OFFSET + 9);
trap_stub!(t_irq10, IRQ_OFFSET + 10);
trap_stub!(t_irq11, IRQ_OFFSET + 11);
trap_stub!(t_irq12, IRQ_OFFSET + 12);
trap_stub!(t_irq13, IRQ_OFFSET + 13);
trap_stub!(t_irq14, IRQ_OFFSET + 14);
trap_stub!(t_irq15, IRQ_OFFSET + 15);

/// Common tail of every stub: finish building the Trapframe and hand it to
/// the dispatcher. Pushes land rax just below the trap number and r15 at the
/// lowest address, matching PushRegs.
#[unsafe(naked)]
pub extern "C" fn alltraps() -> ! {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {trap}",
        trap = sym trap,
    );
}

/// The dispatcher. Never returns: control leaves through env_run or
/// sched_yield.
pub extern "C" fn trap(tf: *mut Trapframe) -> ! {
    unsafe { core::arch::asm!("cld", options(nomem, nostack)) };

    // If this CPU was parked in the idle loop, the interrupt that woke it
    // arrives without the kernel lock; take it back before touching shared
    // state.
    if cpu::thiscpu().cpu_status.swap(CPU_STARTED, Ordering::SeqCst) == CPU_HALTED {
        lock_kernel();
    }

    // All gates are interrupt gates, so IF must be clear here.
    assert!(!x86_64::instructions::interrupts::are_enabled());

    let mut tf = unsafe { &mut *tf };
    if tf.from_user() {
        lock_kernel();
        let e = cpu::curenv().expect("user trap with no current environment");

        // An env_destroy from another CPU left us a note: finish the job.
        if e.env_status == EnvStatus::Dying {
            env::env_free(e);
            cpu::set_curenv(None);
            sched::sched_yield();
        }

        // Work on the copy in the environment record; the stack copy is dead
        // once we context switch.
        e.env_tf = *tf;
        tf = &mut e.env_tf;
    }

    trap_dispatch(tf);

    // Dispatch came back: resume whatever should run on this CPU now.
    match cpu::curenv() {
        Some(e) if e.env_status == EnvStatus::Running => env::env_run(e),
        _ => sched::sched_yield(),
    }
}

fn trap_dispatch(tf: &mut Trapframe) {
    match tf.trapno {
        T_PGFLT => page_fault_handler(tf),
        T_SYSCALL => {
            let ret = syscall::syscall(
                tf.regs.rax,
                tf.regs.rdi,
                tf.regs.rsi,
                tf.regs.rdx,
                tf.regs.rcx,
                tf.regs.r8,
            );
            tf.regs.rax = ret as u64;
        }
        n if n == IRQ_OFFSET + IRQ_TIMER => {
            lapic::eoi();
            sched::sched_yield();
        }
        n if n == IRQ_OFFSET + IRQ_SERIAL => {
            console::interrupt();
            lapic::eoi();
        }
        n if n == IRQ_OFFSET + IRQ_SPURIOUS => {
            // Spurious interrupts deliver no EOI.
            cprintln!("Spurious interrupt on irq 7");
            print_trapframe(tf);
        }
        _ => {
            // Unexpected trap: from the kernel it is fatal, from user mode
            // the environment dies with a diagnostic.
            print_trapframe(tf);
            if !tf.from_user() {
                panic!("unhandled trap {} in kernel", tf.trapno);
            }
            let e = cpu::curenv().expect("user trap with no current environment");
            env::env_destroy(e);
        }
    }
}

/// Resolve a user page fault: deliver it to the environment's upcall on the
/// user exception stack, or destroy the environment. Kernel faults panic.
fn page_fault_handler(tf: &mut Trapframe) {
    let fault_va = match Cr2::read() {
        Ok(addr) => addr.as_u64(),
        Err(_) => panic!("page fault with non-canonical CR2"),
    };

    if !tf.from_user() {
        print_trapframe(tf);
        panic!("kernel-mode page fault at va {:#x}, rip {:#x}", fault_va, tf.rip);
    }

    let e = cpu::curenv().expect("user page fault with no current environment");

    if e.env_pgfault_upcall != 0 {
        let size = core::mem::size_of::<UTrapframe>() as u64;

        // Re-entrant faults chain below the previous frame, leaving one
        // scratch word the upcall uses to stage its return address.
        let utf_va = if tf.rsp >= UXSTACKTOP - PGSIZE && tf.rsp < UXSTACKTOP {
            tf.rsp - 8 - size
        } else {
            UXSTACKTOP - size
        };

        // The faulting environment's address space is the active one, so a
        // successful check means we can write the frame directly.
        let writable = PteFlags::USER | PteFlags::WRITABLE;
        if user_mem_check(e.address_space().root, utf_va, size, writable).is_ok() {
            let utf = utf_va as *mut UTrapframe;
            unsafe {
                (*utf).fault_va = fault_va;
                (*utf).err = tf.errcode;
                (*utf).regs = tf.regs;
                (*utf).rip = tf.rip;
                (*utf).rflags = tf.rflags;
                (*utf).rsp = tf.rsp;
            }
            tf.rsp = utf_va;
            tf.rip = e.env_pgfault_upcall;
            env::env_run(e);
        }
    }

    cprintln!(
        "[{:08x}] user fault va {:#x} ip {:#x}",
        e.env_id,
        fault_va,
        tf.rip
    );
    print_trapframe(tf);
    env::env_destroy(e);
}

static TRAP_NAMES: [&str; 20] = [
    "Divide error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection",
    "Page Fault",
    "(unknown trap)",
    "x87 FPU Floating-Point Error",
    "Alignment Check",
    "Machine-Check",
    "SIMD Floating-Point Exception",
];

fn trap_name(trapno: u64) -> &'static str {
    match trapno {
        n if (n as usize) < TRAP_NAMES.len() => TRAP_NAMES[n as usize],
        T_SYSCALL => "System call",
        n if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&n) => "Hardware Interrupt",
        _ => "(unknown trap)",
    }
}

pub fn print_regs(regs: &PushRegs) {
    cprintln!("  r15  {:#018x}", regs.r15);
    cprintln!("  r14  {:#018x}", regs.r14);
    cprintln!("  r13  {:#018x}", regs.r13);
    cprintln!("  r12  {:#018x}", regs.r12);
    cprintln!("  r11  {:#018x}", regs.r11);
    cprintln!("  r10  {:#018x}", regs.r10);
    cprintln!("  r9   {:#018x}", regs.r9);
    cprintln!("  r8   {:#018x}", regs.r8);
    cprintln!("  rsi  {:#018x}", regs.rsi);
    cprintln!("  rdi  {:#018x}", regs.rdi);
    cprintln!("  rbp  {:#018x}", regs.rbp);
    cprintln!("  rdx  {:#018x}", regs.rdx);
    cprintln!("  rcx  {:#018x}", regs.rcx);
    cprintln!("  rbx  {:#018x}", regs.rbx);
    cprintln!("  rax  {:#018x}", regs.rax);
}

pub fn print_trapframe(tf: &Trapframe) {
    cprintln!("TRAP frame at {:p} on CPU {}", tf as *const Trapframe, cpu::cpunum());
    print_regs(&tf.regs);
    cprintln!("  trap {:#06x} {}", tf.trapno, trap_name(tf.trapno));
    cprintln!("  err  {:#x}", tf.errcode);
    cprintln!("  rip  {:#018x}", tf.rip);
    cprintln!("  cs   {:#06x}", tf.cs);
    cprintln!("  flag {:#018x}", tf.rflags);
    cprintln!("  rsp  {:#018x}", tf.rsp);
    cprintln!("  ss   {:#06x}", tf.ss);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trapframe_layout_matches_restore_sequence() {
        // env_pop_tf pops fifteen registers, skips trapno/errcode, and lets
        // iretq consume the final five words; the offsets are load-bearing.
        assert_eq!(core::mem::size_of::<PushRegs>(), 15 * 8);
        assert_eq!(core::mem::offset_of!(Trapframe, trapno), 120);
        assert_eq!(core::mem::offset_of!(Trapframe, errcode), 128);
        assert_eq!(core::mem::offset_of!(Trapframe, rip), 136);
        assert_eq!(core::mem::offset_of!(Trapframe, ss), 168);
        assert_eq!(core::mem::size_of::<Trapframe>(), 176);
    }

    #[test]
    fn utrapframe_layout() {
        assert_eq!(core::mem::offset_of!(UTrapframe, regs), 16);
        assert_eq!(core::mem::offset_of!(UTrapframe, rip), 136);
        assert_eq!(core::mem::size_of::<UTrapframe>(), 160);
    }
}
