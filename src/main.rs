/*
 * MICA Kernel Entry Point
 *
 * The UEFI bootloader loads this image, exits boot services, and jumps to
 * `_start` with a pointer to the boot handoff record. `_start` moves onto
 * the boot CPU's kernel stack and enters `kstart`, which brings the machine
 * up in dependency order: console and logging first, then physical memory
 * and the kernel address space, the environment table, per-CPU descriptor
 * tables, interrupt plumbing, and finally the first user environments.
 *
 * Once the big kernel lock is held and the initial environments exist, the
 * scheduler takes over and the kernel becomes purely event-driven: every
 * subsequent entry is a trap, a syscall, or a timer tick.
 */

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), feature(alloc_error_handler))]
#![allow(dead_code)]

extern crate alloc;
#[cfg(not(test))]
extern crate rlibc;

#[cfg(not(test))]
use core::panic::PanicInfo;

mod arch;
mod bootinfo;
mod console;
mod cpu;
mod env;
mod error;
mod ipc;
mod loader;
mod logger;
mod memory;
mod sched;
mod spinlock;
mod syscall;
mod trap;

use bootinfo::BootInfo;
#[cfg(not(test))]
use memory::layout::KSTKSIZE;

// User program images, embedded into the kernel by the build system
// (objcopy-style binary blobs with start/size symbols).
unsafe extern "C" {
    static _binary_user_hello_start: u8;
    static _binary_user_hello_size: u8;
    static _binary_user_pingpong_start: u8;
    static _binary_user_pingpong_size: u8;
    static _binary_user_forktest_start: u8;
    static _binary_user_forktest_size: u8;
    static _binary_user_sendpage_start: u8;
    static _binary_user_sendpage_size: u8;
}

/// Slice view of an embedded user image.
///
/// # Safety
/// `start` and `size` must be the linker-generated pair for one blob.
unsafe fn embedded_image(start: *const u8, size: *const u8) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(start, size as usize) }
}

/// Raw entry: get off the bootloader's stack before running any Rust code.
/// The handoff pointer stays in rdi for kstart.
#[cfg(not(test))]
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start(_boot_info: *const BootInfo) -> ! {
    core::arch::naked_asm!(
        "lea rax, [rip + {stack}]",
        "add rax, {stack_size}",
        "mov rsp, rax",
        "xor rbp, rbp",
        "jmp {kstart}",
        stack = sym cpu::PERCPU_KSTACKS,
        stack_size = const KSTKSIZE,
        kstart = sym kstart,
    );
}

#[unsafe(no_mangle)]
pub extern "C" fn kstart(boot_info: &'static BootInfo) -> ! {
    console::init();
    logger::init();
    log::info!("MICA kernel starting...");

    // The handoff record lives in bootloader memory that is only reachable
    // through the boot page tables; copy what outlives memory::init's CR3
    // switch.
    let rsdp = boot_info.rsdp;

    // Physical allocator, kernel address space, heap, self checks.
    memory::init(boot_info);

    // Process table.
    env::init();

    // Per-CPU descriptor state for the boot CPU.
    arch::x86_64::gdt::init_percpu(cpu::cpunum());
    arch::x86_64::idt::init_percpu();

    // Interrupt routing: discover CPUs and the LAPIC, retire the legacy
    // PIC, start the preemption timer.
    let lapic_pa = arch::x86_64::acpi::mp_init(rsdp);
    unsafe {
        let mut pics = pic8259::ChainedPics::new(0x20, 0x28);
        pics.initialize();
        pics.disable();
    }
    arch::x86_64::lapic::init(lapic_pa);

    // From here on, kernel execution is serialised by the big kernel lock;
    // it is released on the way into user mode.
    spinlock::lock_kernel();

    unsafe {
        env::env_create(embedded_image(
            core::ptr::addr_of!(_binary_user_hello_start),
            core::ptr::addr_of!(_binary_user_hello_size),
        ));
        env::env_create(embedded_image(
            core::ptr::addr_of!(_binary_user_pingpong_start),
            core::ptr::addr_of!(_binary_user_pingpong_size),
        ));
        env::env_create(embedded_image(
            core::ptr::addr_of!(_binary_user_forktest_start),
            core::ptr::addr_of!(_binary_user_forktest_size),
        ));
        env::env_create(embedded_image(
            core::ptr::addr_of!(_binary_user_sendpage_start),
            core::ptr::addr_of!(_binary_user_sendpage_size),
        ));
    }

    log::info!("Kernel initialization complete, entering scheduler");
    sched::sched_yield()
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    if let Some(location) = info.location() {
        log::error!(
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("PANIC: {}", info.message());
    }

    loop {
        x86_64::instructions::hlt();
    }
}
