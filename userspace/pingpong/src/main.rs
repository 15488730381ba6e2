#![no_std]
#![no_main]

// Fork a child and bounce a counter back and forth over IPC until it
// reaches ten.

use ulib::fork::fork;
use ulib::ipc::{ipc_recv, ipc_send};
use ulib::println;
use ulib::syscall::sys_getenvid;

#[unsafe(no_mangle)]
pub extern "C" fn umain() {
    let who = fork();
    if who != 0 {
        // Parent: get the ball rolling.
        println!("send 0 from {:08x} to {:08x}", sys_getenvid(), who);
        ipc_send(who, 0, None, 0);
    }

    loop {
        let mut from: i64 = 0;
        let i = ipc_recv(Some(&mut from), None, None);
        println!("{:08x} got {} from {:08x}", sys_getenvid(), i, from);
        if i == 10 {
            return;
        }
        ipc_send(from, i + 1, None, 0);
        if i == 9 {
            return;
        }
    }
}
