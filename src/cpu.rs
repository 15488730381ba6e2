/*
 * Per-CPU State
 *
 * One CpuInfo record per possible CPU, indexed by LAPIC id. Each CPU owns a
 * kernel stack (mapped high, below KSTACKTOP, with an unmapped guard gap
 * between neighbours) and a pointer to the environment it is currently
 * running. The status field is written with atomic swaps so the idle
 * hand-off in the scheduler behaves like the original xchg protocol.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::x86_64::lapic;
use crate::env::Env;
use crate::memory::layout::{KSTACKTOP, KSTKGAP, KSTKSIZE};

/// Maximum number of CPUs
pub const NCPU: usize = 8;

pub const CPU_UNUSED: u32 = 0;
pub const CPU_STARTED: u32 = 1;
pub const CPU_HALTED: u32 = 2;

#[repr(C)]
pub struct CpuInfo {
    pub cpu_id: u32,
    pub cpu_status: AtomicU32,
    /// Environment currently running on this CPU, null if none
    pub cpu_env: *mut Env,
}

impl CpuInfo {
    const fn new() -> CpuInfo {
        CpuInfo {
            cpu_id: 0,
            cpu_status: AtomicU32::new(CPU_UNUSED),
            cpu_env: core::ptr::null_mut(),
        }
    }
}

static mut CPUS: [CpuInfo; NCPU] = [const { CpuInfo::new() }; NCPU];

/// Number of CPUs the MADT reported (at least 1)
static NCPU_FOUND: AtomicU32 = AtomicU32::new(1);

/// Per-CPU kernel stacks, page-aligned so they can be remapped below
/// KSTACKTOP.
#[repr(C, align(4096))]
pub struct KernelStack(pub [u8; KSTKSIZE as usize]);

pub static mut PERCPU_KSTACKS: [KernelStack; NCPU] =
    [const { KernelStack([0; KSTKSIZE as usize]) }; NCPU];

/// Index of the CPU we are running on.
pub fn cpunum() -> usize {
    lapic::id()
}

/// This CPU's CpuInfo record.
pub fn thiscpu() -> &'static mut CpuInfo {
    cpu(cpunum())
}

/// CpuInfo record for CPU `i`.
pub fn cpu(i: usize) -> &'static mut CpuInfo {
    assert!(i < NCPU);
    unsafe { &mut (*core::ptr::addr_of_mut!(CPUS))[i] }
}

pub fn set_ncpu(n: usize) {
    NCPU_FOUND.store(n.clamp(1, NCPU) as u32, Ordering::Relaxed);
}

pub fn ncpu() -> usize {
    NCPU_FOUND.load(Ordering::Relaxed) as usize
}

/// Top of CPU `i`'s kernel stack in the KSTACKTOP region.
pub fn kstacktop(i: usize) -> u64 {
    KSTACKTOP - i as u64 * (KSTKSIZE + KSTKGAP)
}

/// The environment running on this CPU, if any.
pub fn curenv() -> Option<&'static mut Env> {
    let e = thiscpu().cpu_env;
    if e.is_null() { None } else { Some(unsafe { &mut *e }) }
}

pub fn set_curenv(e: Option<&mut Env>) {
    thiscpu().cpu_env = match e {
        Some(e) => e as *mut Env,
        None => core::ptr::null_mut(),
    };
}
