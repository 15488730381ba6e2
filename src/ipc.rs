/*
 * Inter-Process Communication
 *
 * Synchronous rendezvous: a receiver parks itself with ipc::recv and a
 * sender completes the exchange with ipc::try_send. Receiving blocks until
 * someone sends; sending never blocks, it fails with IpcNotRecv if the
 * target is not parked. A page mapping rides along when both sides opt in
 * (sender passes srcva < UTOP, receiver asked with dstva < UTOP).
 *
 * Sending requires no permission relationship between the environments:
 * any two environments that know each other's ids may talk.
 */

use x86_64::VirtAddr;

use crate::cpu::curenv;
use crate::env::{self, EnvStatus};
use crate::error::Error;
use crate::memory::layout::{PGSIZE, UTOP};
use crate::memory::paging::{self, PteFlags};
use crate::sched;
use crate::syscall::check_syscall_perm;

/// Park the current environment until a sender wakes it.
///
/// A `dstva` below UTOP (page-aligned) announces willingness to accept a
/// page mapping there; anything at or above UTOP declines, recorded as the
/// UTOP sentinel. Never returns on success: the environment resumes in user
/// mode with rax already holding 0, courtesy of the sender.
pub fn recv(dstva: u64) -> Result<i64, Error> {
    let e = curenv().ok_or(Error::BadEnv)?;

    if dstva < UTOP {
        if dstva % PGSIZE != 0 {
            return Err(Error::Invalid);
        }
        e.env_ipc_dstva = dstva;
    } else {
        e.env_ipc_dstva = UTOP;
    }

    e.env_ipc_recving = true;
    e.env_status = EnvStatus::NotRunnable;
    e.env_tf.regs.rax = 0;
    sched::sched_yield()
}

/// Try to deliver `value` (and possibly the page at `srcva`) to `envid`.
///
/// Fails with IpcNotRecv unless the target is parked in recv; nothing about
/// the target is modified in that case. On success the target's IPC fields
/// are filled in, its saved rax is cleared so its recv returns 0, and it
/// becomes Runnable.
pub fn try_send(envid: i64, value: u64, srcva: u64, perm: u64) -> Result<(), Error> {
    // Deliberately no permission check: IPC is open to everyone.
    let target = env::envid2env(envid, false)?;
    if !target.env_ipc_recving {
        return Err(Error::IpcNotRecv);
    }

    let cur = curenv().ok_or(Error::BadEnv)?;

    if srcva < UTOP {
        if srcva % PGSIZE != 0 {
            return Err(Error::Invalid);
        }
        let perm = check_syscall_perm(perm)?;

        let (pp, pte) = paging::page_lookup(cur.address_space().root, VirtAddr::new(srcva))
            .ok_or(Error::Invalid)?;
        if perm.contains(PteFlags::WRITABLE)
            && !unsafe { (*pte).flags() }.contains(PteFlags::WRITABLE)
        {
            return Err(Error::Invalid);
        }

        if target.env_ipc_dstva < UTOP {
            paging::page_insert(
                target.address_space().root,
                pp,
                VirtAddr::new(target.env_ipc_dstva),
                perm,
            )
            .map_err(|_| Error::NoMem)?;
            target.env_ipc_perm = perm.bits();
        } else {
            // Receiver declined a page; the value still goes through.
            target.env_ipc_perm = 0;
        }
    } else {
        target.env_ipc_perm = 0;
    }

    target.env_ipc_recving = false;
    target.env_ipc_from = cur.env_id;
    target.env_ipc_value = value;
    target.env_tf.regs.rax = 0;
    target.env_status = EnvStatus::Runnable;
    Ok(())
}
