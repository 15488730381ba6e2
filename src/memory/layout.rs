/*
 * Virtual Memory Layout
 *
 * Fixed constants of the MICA address space, shared (conceptually) between
 * the kernel and user programs. All physical RAM is direct-mapped at
 * KERNBASE; everything below ULIM is reachable from user mode in some form.
 *
 *   4 Gig ............................
 *   UVPT      ──> +------------------+ 0x10000000000  self-mapped page tables (user R-)
 *                 .                  .
 *   KERNBASE, ──> +------------------+ 0xc0000000
 *   KSTACKTOP     | CPU0 kern stack  |  KSTKSIZE
 *                 | - - guard - -    |  KSTKGAP (never mapped)
 *                 | CPU1 kern stack  |
 *                 .                  .
 *   MMIOLIM   ──> +------------------+ 0xbfe00000
 *                 | memory-mapped IO |
 *   ULIM,     ──> +------------------+ 0xbfc00000
 *   MMIOBASE      |  RO frame table  |  (UPAGES)
 *   UPAGES    ──> +------------------+ 0xbca00000
 *                 |  RO env table    |  (UENVS)
 *   UTOP,UENVS──> +------------------+ 0xbc800000   top of user-writable VM
 *   UXSTACKTOP    | user exc. stack  |  one page
 *                 | - - guard - -    |  one page, never mapped
 *   USTACKTOP ──> +------------------+ 0xbc7fe000
 *                 | user stack       |
 *                 .                  .
 *   UTEXT     ──> +------------------+ 0x00800000   programs load here
 *   PFTEMP    ──> |                  | 0x005ff000   fork() scratch page
 *   UTEMP     ──> +------------------+ 0x00400000   temporary mappings
 *   0         ──> +------------------+
 */

/// Size of a page / physical frame in bytes
pub const PGSIZE: u64 = 4096;
/// log2(PGSIZE)
pub const PGSHIFT: u64 = 12;

/// Bytes mapped by one page-directory entry (one full page table)
pub const PTSIZE: u64 = PGSIZE * NPTENTRIES as u64; // 2 MiB

/// Entries per page-table page, at every level
pub const NPTENTRIES: usize = 512;

/// Physical address of the legacy I/O hole
pub const IOPHYSMEM: u64 = 0x0a0000;
/// End of the I/O hole; extended memory starts here
pub const EXTPHYSMEM: u64 = 0x100000;

/// All physical memory is mapped at this virtual address
pub const KERNBASE: u64 = 0xc000_0000;

/// Top of the per-CPU kernel stack area
pub const KSTACKTOP: u64 = KERNBASE;
/// Size of one kernel stack
pub const KSTKSIZE: u64 = 8 * PGSIZE;
/// Size of the unmapped guard below each kernel stack
pub const KSTKGAP: u64 = 8 * PGSIZE;

/// Memory-mapped I/O window
pub const MMIOLIM: u64 = KSTACKTOP - PTSIZE;
pub const MMIOBASE: u64 = MMIOLIM - PTSIZE;

/// Addresses at or above ULIM are off limits to user mode entirely
pub const ULIM: u64 = MMIOBASE;

/// User read-only view of the page tables through the PML4 self-map
pub const UVPT: u64 = 0x100_0000_0000;

/// User read-only window onto the frame descriptor table
pub const UPAGES: u64 = ULIM - 25 * PTSIZE;
/// User read-only window onto the environment table
pub const UENVS: u64 = UPAGES - PTSIZE;

/// Top of user-accessible VM; user code may touch UTOP-1 and down
pub const UTOP: u64 = UENVS;
/// Top of the one-page user exception stack
pub const UXSTACKTOP: u64 = UTOP;
/// Top of the normal user stack (one guard page below the exception stack)
pub const USTACKTOP: u64 = UTOP - 2 * PGSIZE;

/// Where user program images are linked
pub const UTEXT: u64 = 4 * PTSIZE;

/// Temporary page mappings
pub const UTEMP: u64 = 2 * PTSIZE;
/// Temporary mapping used by the user page-fault handler
pub const PFTEMP: u64 = UTEMP + PTSIZE - PGSIZE;

/// Physical load address for non-boot CPU startup code
pub const MPENTRY_PADDR: u64 = 0x7000;

/// PML4 slot occupied by the self-map (derived from UVPT)
pub const PML4_SELF_SLOT: usize = pml4x(UVPT);

/// Page-table index at each of the four levels for `va`
pub const fn pml4x(va: u64) -> usize {
    ((va >> 39) & 0x1ff) as usize
}

pub const fn pdpx(va: u64) -> usize {
    ((va >> 30) & 0x1ff) as usize
}

pub const fn pdx(va: u64) -> usize {
    ((va >> 21) & 0x1ff) as usize
}

pub const fn ptx(va: u64) -> usize {
    ((va >> 12) & 0x1ff) as usize
}

/// Offset within a page
pub const fn pgoff(va: u64) -> u64 {
    va & 0xfff
}

/// Page number of `va` (index into the self-mapped `uvpt` view)
pub const fn pgnum(va: u64) -> u64 {
    va >> PGSHIFT
}

/// Reassemble a canonical virtual address from its four indices
pub const fn pgaddr(l4: usize, l3: usize, l2: usize, l1: usize) -> u64 {
    ((l4 as u64) << 39) | ((l3 as u64) << 30) | ((l2 as u64) << 21) | ((l1 as u64) << 12)
}

/// Round `n` down to the nearest multiple of `align` (a power of two)
pub const fn round_down(n: u64, align: u64) -> u64 {
    n & !(align - 1)
}

/// Round `n` up to the nearest multiple of `align` (a power of two)
pub const fn round_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_decomposition_roundtrips() {
        for &va in &[0u64, 0x1000, UTEXT, USTACKTOP, KERNBASE, UVPT, 0xbc7f_d123] {
            let page = round_down(va, PGSIZE);
            assert_eq!(pgaddr(pml4x(va), pdpx(va), pdx(va), ptx(va)), page);
            assert_eq!(page + pgoff(va), va);
        }
    }

    #[test]
    fn layout_constants_are_consistent() {
        // The user exception stack sits directly below UTOP with a guard
        // page separating it from the normal stack.
        assert_eq!(UXSTACKTOP, UTOP);
        assert_eq!(USTACKTOP, UTOP - 2 * PGSIZE);
        // Windows are table-aligned so they can be mapped wholesale.
        assert_eq!(UPAGES % PTSIZE, 0);
        assert_eq!(UENVS % PTSIZE, 0);
        assert_eq!(UTOP % PTSIZE, 0);
        // The self-map lives in its own PML4 slot, well clear of both the
        // user half and the kernel direct map.
        assert_eq!(PML4_SELF_SLOT, 2);
        assert_ne!(PML4_SELF_SLOT, pml4x(KERNBASE));
        assert_ne!(PML4_SELF_SLOT, pml4x(UTOP - PGSIZE));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_down(0x1fff, PGSIZE), 0x1000);
        assert_eq!(round_up(0x1001, PGSIZE), 0x2000);
        assert_eq!(round_up(0x1000, PGSIZE), 0x1000);
    }
}
