/*
 * User-Visible Memory Layout
 *
 * The constants user programs need: the fixed virtual-memory map and the
 * PTE flag bits the syscall interface accepts. Mirrors the kernel's layout
 * module; the values are part of the kernel/user ABI.
 */

pub const PGSIZE: u64 = 4096;
pub const PGSHIFT: u64 = 12;
pub const PTSIZE: u64 = PGSIZE * NPTENTRIES as u64;
pub const NPTENTRIES: usize = 512;

/// Top of user-accessible memory
pub const UTOP: u64 = 0xbc80_0000;
/// Top of the one-page user exception stack
pub const UXSTACKTOP: u64 = UTOP;
/// Top of the normal user stack
pub const USTACKTOP: u64 = UTOP - 2 * PGSIZE;
/// Read-only window onto the environment table
pub const UENVS: u64 = UTOP;
/// Read-only window onto the frame descriptor table
pub const UPAGES: u64 = UENVS + PTSIZE;
/// Where program images load
pub const UTEXT: u64 = 4 * PTSIZE;
/// Scratch region for temporary mappings
pub const UTEMP: u64 = 2 * PTSIZE;
/// Scratch page used by the page-fault handler while copying
pub const PFTEMP: u64 = UTEMP + PTSIZE - PGSIZE;

// PTE flag bits accepted by the mapping syscalls.
pub const PTE_P: u64 = 1 << 0;
pub const PTE_W: u64 = 1 << 1;
pub const PTE_U: u64 = 1 << 2;
/// Copy-on-write marker (one of the software-available bits)
pub const PTE_COW: u64 = 1 << 11;

/// Bits the kernel will accept from user mode
pub const PTE_SYSCALL: u64 = 0xe07;

// The page-table self-map. The PML4 slot it occupies fixes these bases;
// uvpt[N] is the PTE for page number N, and the shallower arrays expose the
// higher levels the same way.
const SELF_SLOT: u64 = 2;
pub const UVPT: u64 = SELF_SLOT << 39;
pub const UVPD: u64 = UVPT | (SELF_SLOT << 30);
pub const UVPDE: u64 = UVPD | (SELF_SLOT << 21);
pub const UVPML4E: u64 = UVPDE | (SELF_SLOT << 12);

/// Page number of `va`, the index into `uvpt`
pub const fn pgnum(va: u64) -> u64 {
    va >> PGSHIFT
}

pub const fn round_down(va: u64, align: u64) -> u64 {
    va & !(align - 1)
}

/// PTE for page number `pn`, read through the self-map.
pub fn uvpt(pn: u64) -> u64 {
    unsafe { core::ptr::read_volatile((UVPT + pn * 8) as *const u64) }
}

/// Page-directory entry `n` (covers 2 MiB), through the self-map.
pub fn uvpd(n: u64) -> u64 {
    unsafe { core::ptr::read_volatile((UVPD + n * 8) as *const u64) }
}

/// Page-directory-pointer entry `n` (covers 1 GiB), through the self-map.
pub fn uvpde(n: u64) -> u64 {
    unsafe { core::ptr::read_volatile((UVPDE + n * 8) as *const u64) }
}

/// PML4 entry `n` (covers 512 GiB), through the self-map.
pub fn uvpml4e(n: u64) -> u64 {
    unsafe { core::ptr::read_volatile((UVPML4E + n * 8) as *const u64) }
}
