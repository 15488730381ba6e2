/*
 * Global Descriptor Table
 *
 * x86-64 runs a flat memory model, but the GDT still earns its keep: it
 * holds the kernel/user code and data descriptors whose DPLs enforce the
 * ring 0 / ring 3 split, and one Task State Segment per CPU whose RSP0 slot
 * tells the processor which kernel stack to switch to when user mode traps.
 *
 * Each CPU builds and loads its own table during per-CPU initialization.
 * The descriptors are appended in a fixed order so the selector values are
 * identical everywhere; the GD_* constants below are that contract.
 */

use core::mem::MaybeUninit;

use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::cpu::{self, NCPU};

/// Kernel text segment selector
pub const GD_KT: u16 = 0x08;
/// Kernel data segment selector
pub const GD_KD: u16 = 0x10;
/// User text segment selector (use with RPL 3)
pub const GD_UT: u16 = 0x18;
/// User data segment selector (use with RPL 3)
pub const GD_UD: u16 = 0x20;
/// TSS selector (per-CPU tables all use the same slot)
pub const GD_TSS0: u16 = 0x28;

static mut TSS: [TaskStateSegment; NCPU] = [const { TaskStateSegment::new() }; NCPU];
static mut GDTS: [MaybeUninit<GlobalDescriptorTable>; NCPU] =
    [const { MaybeUninit::uninit() }; NCPU];

/// Build and load this CPU's GDT and TSS. RSP0 points at this CPU's kernel
/// stack so traps from user mode land on it.
pub fn init_percpu(cpu_index: usize) {
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
    use x86_64::instructions::tables::load_tss;

    unsafe {
        let tss = &mut (*core::ptr::addr_of_mut!(TSS))[cpu_index];
        tss.privilege_stack_table[0] = VirtAddr::new(cpu::kstacktop(cpu_index));

        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let tss_sel = gdt.append(Descriptor::tss_segment(
            &*(tss as *const TaskStateSegment),
        ));

        // The append order above is what makes the GD_* constants true.
        debug_assert_eq!(kernel_code.0, GD_KT);
        debug_assert_eq!(kernel_data.0, GD_KD);
        debug_assert_eq!(user_code.0 & !3, GD_UT);
        debug_assert_eq!(user_data.0 & !3, GD_UD);
        debug_assert_eq!(tss_sel.0, GD_TSS0);

        let slot = &mut (*core::ptr::addr_of_mut!(GDTS))[cpu_index];
        slot.write(gdt);
        slot.assume_init_ref().load();

        CS::set_reg(kernel_code);
        DS::set_reg(kernel_data);
        ES::set_reg(kernel_data);
        SS::set_reg(kernel_data);
        // The kernel never uses FS or GS; park them on the user data segment.
        FS::set_reg(user_data);
        GS::set_reg(user_data);

        load_tss(tss_sel);
    }

    log::info!("CPU {}: GDT and TSS loaded", cpu_index);
}
