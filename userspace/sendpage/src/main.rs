#![no_std]
#![no_main]

// IPC with a page in tow: the parent maps a page, writes a message into
// it, and sends it to the child, which receives the mapping at a different
// virtual address and reads the message back out.

use ulib::fork::fork;
use ulib::ipc::{ipc_recv, ipc_send};
use ulib::layout::{PTE_P, PTE_U, PTE_W};
use ulib::println;
use ulib::syscall::{sys_getenvid, sys_page_alloc};

const PARENT_VA: u64 = 0x40_0000;
const CHILD_VA: u64 = 0x60_0000;

const MESSAGE: &[u8] = b"greetings from your parent";

#[unsafe(no_mangle)]
pub extern "C" fn umain() {
    let who = fork();

    if who == 0 {
        // Child: accept a page at CHILD_VA along with the value.
        let mut from: i64 = 0;
        let mut perm: u64 = 0;
        let value = ipc_recv(Some(&mut from), Some(CHILD_VA), Some(&mut perm));

        let msg = unsafe { core::slice::from_raw_parts(CHILD_VA as *const u8, MESSAGE.len()) };
        println!(
            "[{:08x}] got {} with perm {:#x} and page saying: {}",
            sys_getenvid(),
            value,
            perm,
            core::str::from_utf8(msg).unwrap_or("<garbage>")
        );
        assert_eq!(msg, MESSAGE);
        return;
    }

    // Parent: build the page and hand it over writable.
    let r = sys_page_alloc(0, PARENT_VA, PTE_P | PTE_U | PTE_W);
    if r < 0 {
        panic!("sendpage: sys_page_alloc failed ({})", r);
    }
    unsafe {
        core::ptr::copy_nonoverlapping(MESSAGE.as_ptr(), PARENT_VA as *mut u8, MESSAGE.len());
    }

    ipc_send(who, 42, Some(PARENT_VA), PTE_P | PTE_U | PTE_W);
    println!("[{:08x}] page sent", sys_getenvid());
}
