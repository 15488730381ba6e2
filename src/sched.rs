/*
 * Round-Robin Scheduler
 *
 * sched_yield scans the environment table circularly, starting one slot past
 * the environment this CPU ran last, and dispatches the first Runnable one.
 * An environment that is Running on another CPU is never chosen. With
 * nothing else runnable the previous environment keeps the CPU if it is
 * still Running; otherwise the CPU parks in sched_halt until the next timer
 * interrupt re-enters the kernel.
 */

use crate::cpu::{self, CPU_HALTED};
use crate::env::{self, EnvStatus};
use crate::memory::kern_pml4;
use crate::spinlock::unlock_kernel;

use core::sync::atomic::Ordering;

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;

/// Pick the next environment and run it. Never returns.
pub fn sched_yield() -> ! {
    let start = match cpu::curenv() {
        Some(e) => env::envx(e.env_id),
        None => 0,
    };

    for i in 0..env::NENV {
        let idx = (start + 1 + i) % env::NENV;
        if env::envs()[idx].env_status == EnvStatus::Runnable {
            env::env_run(&mut env::envs()[idx]);
        }
    }

    // Nothing else wants the CPU; keep running what we had if we can.
    if let Some(cur) = cpu::curenv() {
        if cur.env_status == EnvStatus::Running {
            env::env_run(cur);
        }
    }

    sched_halt()
}

/// Park this CPU until a timer interrupt hands it back to the scheduler.
/// Releases the kernel lock, resets to the top of this CPU's kernel stack,
/// re-enables interrupts, and halts.
pub fn sched_halt() -> ! {
    // With no live environments anywhere there is nothing left to wait for.
    let any_alive = env::envs().iter().any(|e| {
        matches!(
            e.env_status,
            EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying
        )
    });
    if !any_alive {
        log::info!("No runnable environments in the system!");
    }

    cpu::set_curenv(None);
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(kern_pml4()),
            Cr3Flags::empty(),
        );
    }

    // Record the halt so the trap path knows to re-acquire the kernel lock
    // when an interrupt wakes us.
    cpu::thiscpu().cpu_status.swap(CPU_HALTED, Ordering::SeqCst);
    unlock_kernel();

    let stacktop = cpu::kstacktop(cpu::cpunum());
    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "xor rbp, rbp",
            "push 0",
            "push 0",
            "sti",
            "2:",
            "hlt",
            "jmp 2b",
            stack = in(reg) stacktop,
            options(noreturn),
        )
    }
}
