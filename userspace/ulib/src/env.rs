/*
 * Environment Table View
 *
 * Read-only mirror of the kernel's environment records, reached through the
 * UENVS window. The struct layouts here must match the kernel's exactly;
 * they are part of the ABI, field for field.
 */

use crate::layout::UENVS;
use crate::syscall::sys_getenvid;

pub const NENV: usize = 1024;

pub const ENV_FREE: u32 = 0;
pub const ENV_DYING: u32 = 1;
pub const ENV_RUNNABLE: u32 = 2;
pub const ENV_RUNNING: u32 = 3;
pub const ENV_NOT_RUNNABLE: u32 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PushRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub trapno: u64,
    pub errcode: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// One kernel environment record, as visible through UENVS.
#[repr(C)]
pub struct Env {
    pub env_tf: Trapframe,
    pub env_link: i32,
    pub env_id: i64,
    pub env_parent_id: i64,
    pub env_status: u32,
    pub env_runs: u32,
    pub env_cpunum: u32,
    pub env_pml4: u64,
    pub env_pgfault_upcall: u64,
    pub env_ipc_recving: bool,
    pub env_ipc_dstva: u64,
    pub env_ipc_value: u64,
    pub env_ipc_from: i64,
    pub env_ipc_perm: u64,
}

/// Table index encoded in an environment id.
pub const fn envx(envid: i64) -> usize {
    (envid as usize) & (NENV - 1)
}

pub fn envs() -> &'static [Env] {
    unsafe { core::slice::from_raw_parts(UENVS as *const Env, NENV) }
}

static mut THISENV: *const Env = core::ptr::null();

/// Our own environment record.
pub fn thisenv() -> &'static Env {
    unsafe { &*THISENV }
}

/// Point `thisenv` at our record. Called at startup and again in the child
/// after fork, since the child inherits the parent's pointer.
pub fn init_thisenv() {
    let id = sys_getenvid();
    unsafe { THISENV = &envs()[envx(id)] };
}
