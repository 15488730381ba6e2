/*
 * MICA User-Space Support Library
 *
 * Freestanding runtime for user programs: the program entry point, syscall
 * stubs, a view of the environment table and of our own page tables through
 * the kernel's read-only windows, the page-fault upcall machinery, the
 * copy-on-write fork, and IPC conveniences.
 *
 * Programs define `umain` and link against this crate; everything else
 * (startup, thisenv, panic handling) is provided here.
 */

#![no_std]

pub mod env;
pub mod fork;
pub mod ipc;
pub mod layout;
pub mod pgfault;
pub mod print;
pub mod syscall;

use core::panic::PanicInfo;

use crate::println;

unsafe extern "C" {
    fn umain();
}

/// Program entry. The kernel dispatches new environments here with the
/// stack already set up at USTACKTOP.
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    env::init_thisenv();
    unsafe { umain() };
    syscall::sys_env_destroy(0);
    unreachable!()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(location) = info.location() {
        println!(
            "[{:08x}] user panic at {}:{}: {}",
            env::thisenv().env_id,
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        println!("[{:08x}] user panic: {}", env::thisenv().env_id, info.message());
    }
    syscall::sys_env_destroy(0);
    loop {}
}
