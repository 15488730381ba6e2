/*
 * Four-Level Page Tables
 *
 * Page-table manipulation for any root PML4, addressed physically and
 * accessed through the KERNBASE direct map. Entries are machine-format
 * 64-bit words wrapped in an opaque Pte type with accessors; nothing here
 * builds a typed pointer graph out of the hardware tables.
 *
 * Reference counting discipline: every present leaf PTE below the kernel
 * cutoff contributes one pp_ref to the frame it points at, and every
 * intermediate table page is pinned by one pp_ref taken when the walk
 * creates it. page_insert takes its reference *before* removing any old
 * mapping so that re-inserting the same frame at the same address leaves
 * the count unchanged.
 */

use bitflags::bitflags;
use x86_64::registers::control::Cr3;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::Error;
use crate::memory::kaddr;
use crate::memory::layout::*;
use crate::memory::phys::{self, AllocFlags, PageInfo};

bitflags! {
    /// Page-table entry flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const PAGE_SIZE     = 1 << 7;
        const GLOBAL        = 1 << 8;
        // Bits 9-11 are free for software use
        const AVAIL0        = 1 << 9;
        const AVAIL1        = 1 << 10;
        /// Copy-on-write marker, owned by the user-space fork protocol
        const COW           = 1 << 11;
    }
}

/// Flag bits user mode may pass to the page-mapping syscalls
pub const PTE_SYSCALL: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITABLE)
    .union(PteFlags::USER)
    .union(PteFlags::AVAIL0)
    .union(PteFlags::AVAIL1)
    .union(PteFlags::COW);

const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One page-table entry at any of the four levels.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct Pte(u64);

impl Pte {
    pub const fn zero() -> Pte {
        Pte(0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Physical address of the next-level table or leaf frame
    pub fn addr(&self) -> u64 {
        self.0 & PTE_ADDR_MASK
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !PTE_ADDR_MASK)
    }

    pub fn set(&mut self, pa: u64, flags: PteFlags) {
        debug_assert_eq!(pa & !PTE_ADDR_MASK, 0, "unaligned or bogus table address");
        self.0 = pa | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// View a physical frame as a page-table page.
///
/// # Safety
/// `pa` must be a page-aligned frame that really holds a page table; the
/// direct map must be active.
unsafe fn table<'a>(pa: u64) -> &'a mut [Pte; NPTENTRIES] {
    unsafe { &mut *(kaddr(pa) as *mut [Pte; NPTENTRIES]) }
}

/// Descend the four levels to the leaf PTE for `va`.
///
/// With `create`, missing intermediate tables are allocated (zeroed), their
/// refcount is taken, and the parent entry is installed with
/// {PRESENT, WRITABLE, USER}; permissions are enforced at the leaf. Without
/// `create`, a missing level yields None. Never returns a pointer into a
/// huge-page mapping.
pub fn pml4_walk(root: PhysAddr, va: VirtAddr, create: bool) -> Option<*mut Pte> {
    let v = va.as_u64();
    let mut table_pa = root.as_u64();

    for idx in [pml4x(v), pdpx(v), pdx(v)] {
        let entry = &mut unsafe { table(table_pa) }[idx];
        if !entry.is_present() {
            if !create {
                return None;
            }
            let pp = phys::page_alloc(AllocFlags::ZERO)?;
            pp.pp_ref += 1;
            entry.set(
                phys::page2pa(pp),
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
            );
        }
        table_pa = entry.addr();
    }

    Some(&mut unsafe { table(table_pa) }[ptx(v)] as *mut Pte)
}

/// Map the frame `pp` at `va` in the address space rooted at `root` with
/// permissions `perm | PRESENT`. An existing mapping at `va` is removed
/// first; mapping the same frame at the same address again just updates the
/// permissions.
pub fn page_insert(
    root: PhysAddr,
    pp: &mut PageInfo,
    va: VirtAddr,
    perm: PteFlags,
) -> Result<(), Error> {
    let pte = pml4_walk(root, va, true).ok_or(Error::NoMem)?;

    // Take the new reference before tearing down any old mapping, so a
    // self-insert never sees the count dip to zero.
    pp.pp_ref += 1;
    unsafe {
        if (*pte).is_present() {
            page_remove(root, va);
        }
        (*pte).set(phys::page2pa(pp), perm | PteFlags::PRESENT);
    }
    tlb_invalidate(root, va);
    Ok(())
}

/// Look up the mapping for `va`. Returns the frame descriptor and a pointer
/// to its leaf PTE, without modifying anything.
pub fn page_lookup(root: PhysAddr, va: VirtAddr) -> Option<(&'static mut PageInfo, *mut Pte)> {
    let pte = pml4_walk(root, va, false)?;
    unsafe {
        if !(*pte).is_present() {
            return None;
        }
        Some((phys::pa2page((*pte).addr()), pte))
    }
}

/// Unmap `va` if it is mapped; silently a no-op otherwise. Drops the leaf
/// frame's refcount (freeing it at zero), clears the PTE, and invalidates
/// the TLB entry.
pub fn page_remove(root: PhysAddr, va: VirtAddr) {
    let Some((pp, pte)) = page_lookup(root, va) else {
        return;
    };
    phys::page_decref(pp);
    unsafe { (*pte).clear() };
    tlb_invalidate(root, va);
}

/// Invalidate the TLB entry for `va`, but only if the address space being
/// edited is the one loaded on this CPU.
pub fn tlb_invalidate(root: PhysAddr, va: VirtAddr) {
    let (frame, _) = Cr3::read();
    if frame.start_address() == root {
        x86_64::instructions::tlb::flush(va);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_roundtrips_address_and_flags() {
        let mut pte = Pte::zero();
        assert!(!pte.is_present());

        pte.set(0x1234_5000, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER);
        assert!(pte.is_present());
        assert_eq!(pte.addr(), 0x1234_5000);
        assert_eq!(
            pte.flags(),
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER
        );

        pte.clear();
        assert_eq!(pte.raw(), 0);
    }

    #[test]
    fn syscall_mask_matches_hardware_layout() {
        // {User, Present} plus Writable and the three software bits; nothing
        // else may cross the syscall boundary.
        assert_eq!(PTE_SYSCALL.bits(), 0xe07);
        assert_eq!(PteFlags::COW.bits(), 0x800);
        assert!(PTE_SYSCALL.contains(PteFlags::COW));
        assert!(!PTE_SYSCALL.contains(PteFlags::GLOBAL));
    }
}
