/*
 * Interrupt Descriptor Table
 *
 * All 256 gates route into the naked stubs in the trap module, which build a
 * uniform Trapframe before entering the common dispatcher. Vectors 0-31 are
 * the processor exceptions, 32-47 carry the remapped hardware IRQs (LAPIC
 * timer on 32, serial on 36, spurious on 39), and vector 48 is the
 * system-call gate, the only one user mode may invoke directly (DPL 3).
 * Everything else lands in the diagnostic catch-all.
 *
 * Every gate is an interrupt gate, so interrupts are off from the moment a
 * stub runs until the eventual iretq (or sti in the idle loop).
 */

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::trap;

fn stub_addr(f: extern "C" fn() -> !) -> VirtAddr {
    VirtAddr::new(f as usize as u64)
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        unsafe {
            // Anything we do not handle specifically gets the catch-all.
            for vector in 32u8..=255 {
                idt[vector].set_handler_addr(stub_addr(trap::t_default));
            }

            idt.divide_error.set_handler_addr(stub_addr(trap::t_divide));
            idt.debug.set_handler_addr(stub_addr(trap::t_debug));
            idt.non_maskable_interrupt.set_handler_addr(stub_addr(trap::t_nmi));
            idt.breakpoint.set_handler_addr(stub_addr(trap::t_brkpt));
            idt.overflow.set_handler_addr(stub_addr(trap::t_oflow));
            idt.bound_range_exceeded.set_handler_addr(stub_addr(trap::t_bound));
            idt.invalid_opcode.set_handler_addr(stub_addr(trap::t_illop));
            idt.device_not_available.set_handler_addr(stub_addr(trap::t_device));
            idt.double_fault.set_handler_addr(stub_addr(trap::t_dblflt));
            idt.invalid_tss.set_handler_addr(stub_addr(trap::t_tss));
            idt.segment_not_present.set_handler_addr(stub_addr(trap::t_segnp));
            idt.stack_segment_fault.set_handler_addr(stub_addr(trap::t_stack));
            idt.general_protection_fault.set_handler_addr(stub_addr(trap::t_gpflt));
            idt.page_fault.set_handler_addr(stub_addr(trap::t_pgflt));
            idt.x87_floating_point.set_handler_addr(stub_addr(trap::t_fperr));
            idt.alignment_check.set_handler_addr(stub_addr(trap::t_align));
            idt.machine_check.set_handler_addr(stub_addr(trap::t_mchk));
            idt.simd_floating_point.set_handler_addr(stub_addr(trap::t_simderr));

            // Hardware IRQ vectors.
            idt[32].set_handler_addr(stub_addr(trap::t_irq0));
            idt[33].set_handler_addr(stub_addr(trap::t_irq1));
            idt[34].set_handler_addr(stub_addr(trap::t_irq2));
            idt[35].set_handler_addr(stub_addr(trap::t_irq3));
            idt[36].set_handler_addr(stub_addr(trap::t_irq4));
            idt[37].set_handler_addr(stub_addr(trap::t_irq5));
            idt[38].set_handler_addr(stub_addr(trap::t_irq6));
            idt[39].set_handler_addr(stub_addr(trap::t_irq7));
            idt[40].set_handler_addr(stub_addr(trap::t_irq8));
            idt[41].set_handler_addr(stub_addr(trap::t_irq9));
            idt[42].set_handler_addr(stub_addr(trap::t_irq10));
            idt[43].set_handler_addr(stub_addr(trap::t_irq11));
            idt[44].set_handler_addr(stub_addr(trap::t_irq12));
            idt[45].set_handler_addr(stub_addr(trap::t_irq13));
            idt[46].set_handler_addr(stub_addr(trap::t_irq14));
            idt[47].set_handler_addr(stub_addr(trap::t_irq15));

            // The system-call gate is the one gate user code may invoke.
            idt[48]
                .set_handler_addr(stub_addr(trap::t_syscall))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }

        idt
    };
}

/// Load the IDT on this CPU. The table is shared; every CPU calls this once.
pub fn init_percpu() {
    IDT.load();
    log::info!("CPU {}: IDT loaded", crate::cpu::cpunum());
}
