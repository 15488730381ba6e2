/*
 * IPC Conveniences
 *
 * Thin wrappers over the raw send/receive syscalls: receive fills in the
 * sender and permission out-parameters from our env record, and send spins
 * politely (yielding between attempts) until the target is ready.
 */

use crate::env::thisenv;
use crate::layout::UTOP;
use crate::syscall::{sys_ipc_recv, sys_ipc_try_send, sys_yield, E_IPC_NOT_RECV};

/// Receive a value over IPC, blocking until one arrives.
///
/// Pass `pg` to accept a page mapping at that address. On return,
/// `from_store` and `perm_store` (when given) hold the sender's id and the
/// granted permissions (0 if no page came along).
pub fn ipc_recv(from_store: Option<&mut i64>, pg: Option<u64>, perm_store: Option<&mut u64>) -> u64 {
    let dstva = pg.unwrap_or(UTOP);
    let r = sys_ipc_recv(dstva);
    if r < 0 {
        panic!("ipc_recv: syscall failed ({})", r);
    }

    let e = thisenv();
    if let Some(from) = from_store {
        *from = e.env_ipc_from;
    }
    if let Some(perm) = perm_store {
        *perm = e.env_ipc_perm;
    }
    e.env_ipc_value
}

/// Send `val` (and optionally the page at `pg` with `perm`) to `to_env`,
/// retrying until the target enters receive.
pub fn ipc_send(to_env: i64, val: u64, pg: Option<u64>, perm: u64) {
    let srcva = pg.unwrap_or(UTOP);
    loop {
        let r = sys_ipc_try_send(to_env, val, srcva, perm);
        if r == 0 {
            return;
        }
        if r != -E_IPC_NOT_RECV {
            panic!("ipc_send: syscall failed ({})", r);
        }
        sys_yield();
    }
}
