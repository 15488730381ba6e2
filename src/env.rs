/*
 * Environments
 *
 * An environment is MICA's unit of isolation: one user address space, one
 * saved register frame, one scheduling status. The table of NENV records is
 * fixed at boot, reached through a free list, and mapped read-only into
 * every address space at UENVS so user code can inspect it.
 *
 * Environment ids are generational: the low bits index the table, the high
 * bits count how many times the slot has been recycled, so a stale id held
 * by user code is rejected instead of aliasing its successor.
 */

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::arch::x86_64::gdt::{GD_UD, GD_UT};
use crate::cpu::{self, curenv, set_curenv};
use crate::error::Error;
use crate::memory::address_space::AddressSpace;
use crate::memory::kern_pml4;
use crate::memory::layout::USTACKTOP;
use crate::sched;
use crate::spinlock::unlock_kernel;
use crate::trap::Trapframe;

/// Number of environment slots
pub const NENV: usize = 1024;
/// Generation step; must be >= log2(NENV)
pub const ENVGENSHIFT: u64 = 12;

/// Interrupt-enable bit in rflags
const FL_IF: u64 = 1 << 9;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

/// One environment record. The layout is fixed: user code reads these
/// through the UENVS window.
#[repr(C)]
pub struct Env {
    /// Saved registers, restored wholesale on dispatch
    pub env_tf: Trapframe,
    /// Next free slot (index), -1 for none; valid only when Free
    pub env_link: i32,
    /// Generational id, low bits equal to the table index
    pub env_id: i64,
    /// Id of the environment that created this one
    pub env_parent_id: i64,
    pub env_status: EnvStatus,
    /// Times this environment has been dispatched
    pub env_runs: u32,
    /// CPU the environment is running on, valid while Running
    pub env_cpunum: u32,
    /// Physical address of this environment's PML4
    pub env_pml4: u64,
    /// User VA of the page-fault upcall entry, 0 if none installed
    pub env_pgfault_upcall: u64,

    // IPC state
    pub env_ipc_recving: bool,
    pub env_ipc_dstva: u64,
    pub env_ipc_value: u64,
    pub env_ipc_from: i64,
    pub env_ipc_perm: u64,
}

impl Env {
    pub fn address_space(&self) -> AddressSpace {
        AddressSpace {
            root: PhysAddr::new(self.env_pml4),
        }
    }
}

static mut ENVS: *mut Env = core::ptr::null_mut();
static mut ENV_FREE_LIST: i32 = -1;

/// Called by memory::init once the table's backing store exists.
pub fn set_table(table: *mut Env) {
    unsafe { ENVS = table };
}

pub fn envs() -> &'static mut [Env] {
    unsafe { core::slice::from_raw_parts_mut(ENVS, NENV) }
}

/// Table index encoded in an environment id.
pub const fn envx(envid: i64) -> usize {
    (envid as usize) & (NENV - 1)
}

/// Successor id for a slot being recycled: bump the generation, keep the
/// index, never produce zero or a negative id.
const fn next_env_id(old_id: i64, index: usize) -> i64 {
    let mut generation = (old_id + (1 << ENVGENSHIFT)) & !((NENV - 1) as i64);
    if generation <= 0 {
        generation = 1 << ENVGENSHIFT;
    }
    generation | index as i64
}

/// Mark every slot free, in table order, so the first allocation returns
/// envs[0].
pub fn init() {
    unsafe { ENV_FREE_LIST = -1 };
    for i in (0..NENV).rev() {
        let e = &mut envs()[i];
        e.env_id = 0;
        e.env_status = EnvStatus::Free;
        e.env_link = unsafe { ENV_FREE_LIST };
        unsafe { ENV_FREE_LIST = i as i32 };
    }
    log::info!("Environment table initialized ({} slots)", NENV);
}

/// Resolve an environment id. Id 0 means the caller. With `check_perm`, the
/// target must be the caller or one of its immediate children.
pub fn envid2env(envid: i64, check_perm: bool) -> Result<&'static mut Env, Error> {
    if envid == 0 {
        return curenv().ok_or(Error::BadEnv);
    }

    let e = &mut envs()[envx(envid)];
    if e.env_status == EnvStatus::Free || e.env_id != envid {
        return Err(Error::BadEnv);
    }

    if check_perm {
        let cur_id = curenv().ok_or(Error::BadEnv)?.env_id;
        if e.env_id != cur_id && e.env_parent_id != cur_id {
            return Err(Error::BadEnv);
        }
    }

    Ok(e)
}

/// Allocate and initialize a new environment: fresh address space, fresh
/// generational id, registers zeroed except for the user-mode segment state.
pub fn env_alloc(parent_id: i64) -> Result<&'static mut Env, Error> {
    let head = unsafe { ENV_FREE_LIST };
    if head < 0 {
        return Err(Error::NoFreeEnv);
    }
    let e = &mut envs()[head as usize];

    let aspace = AddressSpace::create()?;
    e.env_pml4 = aspace.root.as_u64();

    e.env_id = next_env_id(e.env_id, head as usize);
    e.env_parent_id = parent_id;
    e.env_status = EnvStatus::Runnable;
    e.env_runs = 0;
    e.env_cpunum = 0;

    // Clear the saved registers so nothing leaks from the slot's previous
    // occupant, then set up the user-mode segment state. rip is filled in by
    // the loader or inherited through exofork.
    e.env_tf = Trapframe::default();
    e.env_tf.ss = (GD_UD | 3) as u64;
    e.env_tf.rsp = USTACKTOP;
    e.env_tf.cs = (GD_UT | 3) as u64;
    e.env_tf.rflags |= FL_IF;

    e.env_pgfault_upcall = 0;
    e.env_ipc_recving = false;
    e.env_ipc_dstva = 0;
    e.env_ipc_value = 0;
    e.env_ipc_from = 0;
    e.env_ipc_perm = 0;

    unsafe { ENV_FREE_LIST = e.env_link };
    e.env_link = -1;

    log::info!(
        "[{:08x}] new env {:08x}",
        curenv().map(|c| c.env_id).unwrap_or(0),
        e.env_id
    );
    Ok(e)
}

/// Create the first user environment from an embedded ELF image. Only used
/// during bring-up; a bad image here is fatal.
pub fn env_create(binary: &[u8]) -> &'static mut Env {
    let e = match env_alloc(0) {
        Ok(e) => e,
        Err(err) => panic!("env_create: env_alloc failed: {}", err),
    };
    if let Err(err) = crate::loader::load_image(e, binary) {
        panic!("env_create: {}", err);
    }
    e
}

/// Release everything an environment owns and return its slot to the free
/// list.
pub fn env_free(e: &mut Env) {
    // If we are freeing the active address space, get off it first.
    if curenv().map(|c| c.env_id) == Some(e.env_id) {
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(kern_pml4()),
                Cr3Flags::empty(),
            );
        }
    }

    log::info!(
        "[{:08x}] free env {:08x}",
        curenv().map(|c| c.env_id).unwrap_or(0),
        e.env_id
    );

    let mut aspace = e.address_space();
    aspace.destroy();
    e.env_pml4 = 0;

    e.env_status = EnvStatus::Free;
    e.env_link = unsafe { ENV_FREE_LIST };
    unsafe { ENV_FREE_LIST = envx(e.env_id) as i32 };
}

/// Destroy an environment. If it is running on another CPU it is only marked
/// Dying; its next kernel entry finishes the job. Destroying the current
/// environment does not return.
pub fn env_destroy(e: &mut Env) {
    let is_cur = curenv().map(|c| c.env_id) == Some(e.env_id);
    if e.env_status == EnvStatus::Running && !is_cur {
        e.env_status = EnvStatus::Dying;
        return;
    }

    env_free(e);

    if is_cur {
        set_curenv(None);
        sched::sched_yield();
    }
}

/// Context switch into `e`: make it the current environment on this CPU,
/// load its address space, drop the kernel lock, and restore its registers.
pub fn env_run(e: &mut Env) -> ! {
    if let Some(cur) = curenv() {
        if cur.env_status == EnvStatus::Running {
            cur.env_status = EnvStatus::Runnable;
        }
    }

    e.env_status = EnvStatus::Running;
    e.env_runs += 1;
    e.env_cpunum = cpu::cpunum() as u32;
    let tf = &e.env_tf as *const Trapframe;
    let root = e.env_pml4;
    set_curenv(Some(e));

    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(root)),
            Cr3Flags::empty(),
        );
    }

    unlock_kernel();
    unsafe { env_pop_tf(tf) }
}

/// Restore a saved Trapframe and drop to user mode with iretq. The fifteen
/// pops mirror the pushes in `alltraps`; trapno and errcode are skipped.
#[unsafe(naked)]
pub unsafe extern "C" fn env_pop_tf(tf: *const Trapframe) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_ids_keep_index_and_stay_positive() {
        for index in [0usize, 1, 511, NENV - 1] {
            let first = next_env_id(0, index);
            assert!(first > 0);
            assert_eq!(envx(first), index);

            // Recycling the slot must change the id while preserving the
            // index, so stale ids are refused.
            let second = next_env_id(first, index);
            assert!(second > 0);
            assert_ne!(second, first);
            assert_eq!(envx(second), index);
        }
    }

    #[test]
    fn generation_wraparound_never_goes_nonpositive() {
        let mut id = 0i64;
        for _ in 0..10_000 {
            id = next_env_id(id, 7);
            assert!(id > 0);
            assert_eq!(envx(id), 7);
        }
    }
}
