/*
 * System Calls
 *
 * User mode enters through the DPL-3 interrupt gate at vector 48 with the
 * call number in rax and up to five arguments in rdi, rsi, rdx, rcx, r8.
 * The dispatcher validates everything a syscall receives before touching
 * kernel state: user virtual addresses must be page-aligned and below UTOP,
 * and permission words must carry {User, Present} with nothing outside the
 * syscall-permitted mask. Errors travel back as negative values in rax.
 */

pub mod handlers;
pub mod numbers;

use handlers::*;
use numbers::*;

use crate::error::Error;
use crate::memory::layout::{PGSIZE, UTOP};
use crate::memory::paging::{PteFlags, PTE_SYSCALL};

/// Dispatch a system call. Called from the trap path with the saved
/// argument registers; the return value lands in the caller's rax.
pub fn syscall(num: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> i64 {
    let result = match num {
        SYS_CPUTS => sys_cputs(a1, a2),
        SYS_CGETC => sys_cgetc(),
        SYS_GETENVID => sys_getenvid(),
        SYS_ENV_DESTROY => sys_env_destroy(a1 as i64),
        SYS_YIELD => sys_yield(),
        SYS_EXOFORK => sys_exofork(),
        SYS_ENV_SET_STATUS => sys_env_set_status(a1 as i64, a2),
        SYS_PAGE_ALLOC => sys_page_alloc(a1 as i64, a2, a3),
        SYS_PAGE_MAP => sys_page_map(a1 as i64, a2, a3 as i64, a4, a5),
        SYS_PAGE_UNMAP => sys_page_unmap(a1 as i64, a2),
        SYS_ENV_SET_PGFAULT_UPCALL => sys_env_set_pgfault_upcall(a1 as i64, a2),
        SYS_IPC_TRY_SEND => sys_ipc_try_send(a1 as i64, a2, a3, a4),
        SYS_IPC_RECV => sys_ipc_recv(a1),
        _ => Err(Error::Invalid),
    };

    match result {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

/// A user virtual address argument: page-aligned, strictly below UTOP.
pub fn check_user_va(va: u64) -> Result<(), Error> {
    if va % PGSIZE != 0 || va >= UTOP {
        return Err(Error::Invalid);
    }
    Ok(())
}

/// A permission argument: {User, Present} required, nothing outside the
/// syscall mask allowed.
pub fn check_syscall_perm(raw: u64) -> Result<PteFlags, Error> {
    let perm = PteFlags::from_bits(raw).ok_or(Error::Invalid)?;
    if !PTE_SYSCALL.contains(perm) {
        return Err(Error::Invalid);
    }
    if !perm.contains(PteFlags::USER | PteFlags::PRESENT) {
        return Err(Error::Invalid);
    }
    Ok(perm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_va_validation() {
        assert!(check_user_va(0).is_ok());
        assert!(check_user_va(0x80_0000).is_ok());
        assert!(check_user_va(0x80_0001).is_err()); // unaligned
        assert!(check_user_va(UTOP).is_err()); // at the boundary
        assert!(check_user_va(UTOP - PGSIZE).is_ok());
        assert!(check_user_va(u64::MAX & !0xfff).is_err());
    }

    #[test]
    fn perm_validation() {
        let up = (PteFlags::USER | PteFlags::PRESENT).bits();
        assert!(check_syscall_perm(up).is_ok());
        assert!(check_syscall_perm(up | PteFlags::WRITABLE.bits()).is_ok());
        assert!(check_syscall_perm(up | PteFlags::COW.bits()).is_ok());
        // Missing User or Present
        assert!(check_syscall_perm(PteFlags::PRESENT.bits()).is_err());
        assert!(check_syscall_perm(PteFlags::USER.bits()).is_err());
        // Hardware-only bits may not cross the boundary
        assert!(check_syscall_perm(up | PteFlags::GLOBAL.bits()).is_err());
        assert!(check_syscall_perm(up | 0x1000).is_err());
    }
}
