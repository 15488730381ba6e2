/*
 * Local APIC Driver
 *
 * Programs the per-CPU interrupt controller: spurious-interrupt vector (which
 * also enables the unit), the periodic timer that drives preemption, masked
 * LINT lines, and the error vector. Register access goes through the MMIO
 * window the memory subsystem maps over the LAPIC's physical base.
 *
 * Register writes are followed by a read of the ID register; the LAPIC
 * requires a load to post the store.
 */

use crate::memory::mmio_map_region;
use crate::trap::{IRQ_OFFSET, IRQ_SPURIOUS, IRQ_TIMER};

// Register offsets (bytes from the LAPIC base)
const ID: usize = 0x020;
const VER: usize = 0x030;
const TPR: usize = 0x080;
const EOI: usize = 0x0b0;
const SVR: usize = 0x0f0;
const ESR: usize = 0x280;
const TIMER: usize = 0x320;
const LINT0: usize = 0x350;
const LINT1: usize = 0x360;
const ERROR: usize = 0x370;
const TICR: usize = 0x380;
const TDCR: usize = 0x3e0;

/// SVR: unit enable
const SVR_ENABLE: u32 = 0x100;
/// Timer: periodic mode
const TIMER_PERIODIC: u32 = 0x2_0000;
/// LVT: masked
const MASKED: u32 = 0x1_0000;
/// Timer divide: by 1
const TDCR_X1: u32 = 0xb;

/// Error interrupt vector (handled by the catch-all)
const IRQ_ERROR: u64 = 19;

/// Timer initial count; the period of the scheduling tick
const TIMER_COUNT: u32 = 10_000_000;

static mut LAPIC: *mut u32 = core::ptr::null_mut();

fn read(reg: usize) -> u32 {
    unsafe { core::ptr::read_volatile(LAPIC.add(reg / 4)) }
}

fn write(reg: usize, value: u32) {
    unsafe {
        core::ptr::write_volatile(LAPIC.add(reg / 4), value);
        // Wait for the write to finish by reading.
        core::ptr::read_volatile(LAPIC.add(ID / 4));
    }
}

/// Map the LAPIC registers and bring the unit up on this CPU.
pub fn init(lapic_pa: u64) {
    unsafe {
        if LAPIC.is_null() {
            LAPIC = mmio_map_region(lapic_pa, 4096).as_mut_ptr::<u32>();
        }
    }

    // Enable the unit and pick the spurious vector.
    write(SVR, SVR_ENABLE | (IRQ_OFFSET + IRQ_SPURIOUS) as u32);

    // Periodic timer on the scheduling vector, counting down from
    // TIMER_COUNT at bus frequency.
    write(TDCR, TDCR_X1);
    write(TIMER, TIMER_PERIODIC | (IRQ_OFFSET + IRQ_TIMER) as u32);
    write(TICR, TIMER_COUNT);

    // No lines are wired through LINT0/LINT1 in symmetric I/O mode.
    write(LINT0, MASKED);
    write(LINT1, MASKED);

    write(ERROR, (IRQ_OFFSET + IRQ_ERROR) as u32);

    // Clear any stale error state (back-to-back writes per spec).
    write(ESR, 0);
    write(ESR, 0);

    // Ack any interrupt left pending from before we owned the unit.
    write(EOI, 0);

    // Accept everything: task priority 0.
    write(TPR, 0);

    log::info!(
        "LAPIC enabled at {:#x} (version {:#x}), timer period {}",
        lapic_pa,
        read(VER) & 0xff,
        TIMER_COUNT
    );
}

/// APIC id of the current CPU; 0 until the unit is mapped.
pub fn id() -> usize {
    unsafe {
        if LAPIC.is_null() {
            return 0;
        }
    }
    (read(ID) >> 24) as usize
}

/// Signal end-of-interrupt for the current interrupt.
pub fn eoi() {
    unsafe {
        if LAPIC.is_null() {
            return;
        }
    }
    write(EOI, 0);
}
