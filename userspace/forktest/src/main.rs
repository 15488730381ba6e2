#![no_std]
#![no_main]

// Exercise copy-on-write fork: after the fork, parent and child write
// different values through the same virtual address and must each observe
// only their own.

use ulib::fork::fork;
use ulib::println;
use ulib::syscall::sys_getenvid;

static mut SHARED: u64 = 0;

fn write_shared(value: u64) {
    unsafe { core::ptr::write_volatile(core::ptr::addr_of_mut!(SHARED), value) }
}

fn read_shared() -> u64 {
    unsafe { core::ptr::read_volatile(core::ptr::addr_of!(SHARED)) }
}

#[unsafe(no_mangle)]
pub extern "C" fn umain() {
    write_shared(0x11);

    let who = fork();
    if who == 0 {
        write_shared(0xcd);
        println!("[{:08x}] child sees {:#x}", sys_getenvid(), read_shared());
        assert_eq!(read_shared(), 0xcd);
    } else {
        write_shared(0xab);
        println!("[{:08x}] parent sees {:#x}", sys_getenvid(), read_shared());
        assert_eq!(read_shared(), 0xab);
    }
}
