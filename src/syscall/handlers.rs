/*
 * System Call Handlers
 *
 * One function per syscall. Handlers run with the big kernel lock held and
 * the calling environment's address space active, so user pointers that
 * pass user_mem_assert can be dereferenced directly.
 */

use crate::cpu::curenv;
use crate::env::{self, Env, EnvStatus};
use crate::error::Error;
use crate::ipc;
use crate::memory::address_space::user_mem_check;
use crate::memory::paging::{self, PteFlags};
use crate::memory::phys::{self, AllocFlags};
use crate::sched;
use crate::syscall::{check_syscall_perm, check_user_va};
use crate::{console, cprintln};

use x86_64::VirtAddr;

/// Check [va, va+len) against `perm` in `e`'s address space; destroy the
/// environment on failure rather than returning.
fn user_mem_assert(e: &mut Env, va: u64, len: u64, perm: PteFlags) {
    if let Err(fault_va) = user_mem_check(e.address_space().root, va, len, perm | PteFlags::USER) {
        cprintln!(
            "[{:08x}] user_mem_check assertion failure for va {:#x}",
            e.env_id,
            fault_va
        );
        env::env_destroy(e);
        // env_destroy of the caller does not return.
    }
}

/// Print a user-supplied string to the console. Faulting memory destroys
/// the caller.
pub fn sys_cputs(s: u64, len: u64) -> Result<i64, Error> {
    let e = curenv().ok_or(Error::BadEnv)?;
    user_mem_assert(e, s, len, PteFlags::USER);

    let bytes = unsafe { core::slice::from_raw_parts(s as *const u8, len as usize) };
    console::put_bytes(bytes);
    Ok(0)
}

/// Read a character from the console without blocking; 0 if none pending.
pub fn sys_cgetc() -> Result<i64, Error> {
    Ok(console::getc() as i64)
}

pub fn sys_getenvid() -> Result<i64, Error> {
    Ok(curenv().ok_or(Error::BadEnv)?.env_id)
}

/// Destroy the given environment (permission-checked).
pub fn sys_env_destroy(envid: i64) -> Result<i64, Error> {
    let cur_id = curenv().ok_or(Error::BadEnv)?.env_id;
    let e = env::envid2env(envid, true)?;
    if e.env_id == cur_id {
        cprintln!("[{:08x}] exiting gracefully", cur_id);
    } else {
        cprintln!("[{:08x}] destroying {:08x}", cur_id, e.env_id);
    }
    env::env_destroy(e);
    Ok(0)
}

/// Give up the CPU. Control comes back whenever the scheduler picks the
/// caller again; the syscall itself never returns through this path.
pub fn sys_yield() -> Result<i64, Error> {
    sched::sched_yield()
}

/// Create a blank child: the caller's registers, a fresh empty address
/// space, status NotRunnable. Returns the child's id to the parent and 0 to
/// the child (via the copied, tweaked register frame).
pub fn sys_exofork() -> Result<i64, Error> {
    let (parent_id, parent_tf) = {
        let cur = curenv().ok_or(Error::BadEnv)?;
        (cur.env_id, cur.env_tf)
    };

    let child = env::env_alloc(parent_id)?;
    child.env_status = EnvStatus::NotRunnable;
    child.env_tf = parent_tf;
    child.env_tf.regs.rax = 0;
    Ok(child.env_id)
}

/// Set an environment's status to Runnable or NotRunnable.
pub fn sys_env_set_status(envid: i64, status: u64) -> Result<i64, Error> {
    let status = match status {
        s if s == EnvStatus::Runnable as u64 => EnvStatus::Runnable,
        s if s == EnvStatus::NotRunnable as u64 => EnvStatus::NotRunnable,
        _ => return Err(Error::Invalid),
    };

    let e = env::envid2env(envid, true)?;
    e.env_status = status;
    Ok(0)
}

/// Allocate a zeroed page and map it at `va` in `envid`'s address space.
/// An existing mapping at `va` is replaced.
pub fn sys_page_alloc(envid: i64, va: u64, perm: u64) -> Result<i64, Error> {
    let e = env::envid2env(envid, true)?;
    check_user_va(va)?;
    let perm = check_syscall_perm(perm)?;

    let pp = phys::page_alloc(AllocFlags::ZERO).ok_or(Error::NoMem)?;
    if paging::page_insert(e.address_space().root, pp, VirtAddr::new(va), perm).is_err() {
        phys::page_free(pp);
        return Err(Error::NoMem);
    }
    Ok(0)
}

/// Map the page at `srcva` in `src_envid` into `dst_envid` at `dstva`.
/// `perm` may not grant write access to a page that is read-only in the
/// source.
pub fn sys_page_map(
    src_envid: i64,
    srcva: u64,
    dst_envid: i64,
    dstva: u64,
    perm: u64,
) -> Result<i64, Error> {
    let src = env::envid2env(src_envid, true)?;
    let dst = env::envid2env(dst_envid, true)?;
    check_user_va(srcva)?;
    check_user_va(dstva)?;
    let perm = check_syscall_perm(perm)?;

    let (pp, pte) = paging::page_lookup(src.address_space().root, VirtAddr::new(srcva))
        .ok_or(Error::Invalid)?;

    if perm.contains(PteFlags::WRITABLE) && !unsafe { (*pte).flags() }.contains(PteFlags::WRITABLE)
    {
        return Err(Error::Invalid);
    }

    paging::page_insert(dst.address_space().root, pp, VirtAddr::new(dstva), perm)?;
    Ok(0)
}

/// Unmap `va` in `envid`'s address space. Unmapping an unmapped page
/// succeeds silently.
pub fn sys_page_unmap(envid: i64, va: u64) -> Result<i64, Error> {
    let e = env::envid2env(envid, true)?;
    check_user_va(va)?;
    paging::page_remove(e.address_space().root, VirtAddr::new(va));
    Ok(0)
}

/// Install the page-fault upcall entry point for `envid`.
pub fn sys_env_set_pgfault_upcall(envid: i64, func: u64) -> Result<i64, Error> {
    let e = env::envid2env(envid, true)?;
    e.env_pgfault_upcall = func;
    Ok(0)
}

pub fn sys_ipc_try_send(envid: i64, value: u64, srcva: u64, perm: u64) -> Result<i64, Error> {
    ipc::try_send(envid, value, srcva, perm)?;
    Ok(0)
}

pub fn sys_ipc_recv(dstva: u64) -> Result<i64, Error> {
    // Diverges on success; the matching sender writes the resumption value.
    ipc::recv(dstva)
}
