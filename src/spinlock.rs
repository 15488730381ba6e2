/*
 * Mutual Exclusion Spin Locks
 *
 * Ticket locks: acquirers take a ticket with an atomic fetch-add and spin
 * until the owner counter reaches it, so the lock is FIFO-fair across CPUs.
 * The acquire/release orderings provide the same barriers the original
 * xchg-based lock relied on.
 *
 * The big kernel lock serialises all kernel-mode execution: it is taken on
 * every user->kernel transition and dropped immediately before returning to
 * user mode (or before parking the CPU in the idle hlt loop).
 */

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::cpu;

pub struct Spinlock {
    next_ticket: AtomicU32,
    owner: AtomicU32,
    /// CPU currently holding the lock, -1 if unheld. Debug aid only.
    holder: AtomicI32,
    name: &'static str,
}

impl Spinlock {
    pub const fn new(name: &'static str) -> Spinlock {
        Spinlock {
            next_ticket: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            holder: AtomicI32::new(-1),
            name,
        }
    }

    /// Acquire the lock, spinning until it is free.
    pub fn acquire(&self) {
        if self.holding() {
            panic!("CPU {} cannot acquire {}: already holding", cpu::cpunum(), self.name);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.owner.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }

        self.holder.store(cpu::cpunum() as i32, Ordering::Relaxed);
    }

    /// Release the lock.
    pub fn release(&self) {
        if !self.holding() {
            panic!("CPU {} cannot release {}: not held here", cpu::cpunum(), self.name);
        }

        self.holder.store(-1, Ordering::Relaxed);
        let owner = self.owner.load(Ordering::Relaxed);
        self.owner.store(owner.wrapping_add(1), Ordering::Release);
    }

    /// Whether this CPU holds the lock.
    pub fn holding(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == cpu::cpunum() as i32
    }
}

/// The big kernel lock
static KERNEL_LOCK: Spinlock = Spinlock::new("kernel_lock");

pub fn lock_kernel() {
    KERNEL_LOCK.acquire();
}

pub fn unlock_kernel() {
    KERNEL_LOCK.release();
}

pub fn holding_kernel_lock() -> bool {
    KERNEL_LOCK.holding()
}
