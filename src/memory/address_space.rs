/*
 * Address Spaces
 *
 * A process address space is a bare PML4 frame plus indexing logic; there is
 * no typed tree mirroring the hardware tables. The user half (below UTOP) is
 * private and starts empty. The kernel half is identical everywhere:
 * the read-only windows between UTOP and KERNBASE are leaf-copied from the
 * kernel root, everything from KERNBASE up is shared structurally by
 * mirroring the kernel PDPT entries, and a self-map entry exposes the tables
 * themselves read-only at UVPT.
 */

use x86_64::{PhysAddr, VirtAddr};

use crate::error::Error;
use crate::memory::layout::*;
use crate::memory::paging::{self, Pte, PteFlags};
use crate::memory::phys::{self, AllocFlags};
use crate::memory::{kaddr, kern_pml4};

/// A process address space, identified by the physical address of its PML4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pub root: PhysAddr,
}

unsafe fn table<'a>(pa: u64) -> &'a mut [Pte; NPTENTRIES] {
    unsafe { &mut *(kaddr(pa) as *mut [Pte; NPTENTRIES]) }
}

impl AddressSpace {
    /// Build a fresh address space with an empty user half and the shared
    /// kernel half installed.
    pub fn create() -> Result<AddressSpace, Error> {
        let pml4_page = phys::page_alloc(AllocFlags::ZERO).ok_or(Error::NoMem)?;
        pml4_page.pp_ref += 1;
        let root = PhysAddr::new(phys::page2pa(pml4_page));

        // Leaf-copy the kernel-shared window between UTOP and KERNBASE
        // (UPAGES, UENVS, MMIO, kernel stacks). This forces allocation of
        // the matching intermediate tables in the new space.
        let mut va = UTOP;
        while va < KERNBASE {
            if let Some(kern_pte) = paging::pml4_walk(kern_pml4(), VirtAddr::new(va), false) {
                if unsafe { (*kern_pte).is_present() } {
                    let Some(pte) = paging::pml4_walk(root, VirtAddr::new(va), true) else {
                        phys::page_decref(phys::pa2page(root.as_u64()));
                        return Err(Error::NoMem);
                    };
                    unsafe { *pte = *kern_pte };
                }
            }
            va += PGSIZE;
        }

        unsafe {
            let pml4 = table(root.as_u64());

            // The window copy above created the low PML4 entry; only an
            // empty kernel map could leave it absent.
            if !pml4[0].is_present() {
                let Some(pdpt_page) = phys::page_alloc(AllocFlags::ZERO) else {
                    phys::page_decref(phys::pa2page(root.as_u64()));
                    return Err(Error::NoMem);
                };
                pdpt_page.pp_ref += 1;
                pml4[0].set(
                    phys::page2pa(pdpt_page),
                    PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
                );
            }

            // Mirror every kernel-half PDPT entry, not just the one covering
            // the first gigabyte, so RAM beyond 1 GiB shows up here too.
            let kern_root = table(kern_pml4().as_u64());
            let pdpt = table(pml4[0].addr());
            let kern_pdpt = table(kern_root[0].addr());
            for i in pdpx(KERNBASE)..NPTENTRIES {
                pdpt[i] = kern_pdpt[i];
            }

            // Self-map: user code reads its own page tables through UVPT.
            pml4[PML4_SELF_SLOT].set(root.as_u64(), PteFlags::PRESENT | PteFlags::USER);
        }

        Ok(AddressSpace { root })
    }

    /// Tear down the user half and release every frame this address space
    /// owns, the PML4 included.
    ///
    /// The caller must guarantee no CPU still has this root loaded in CR3.
    pub fn destroy(&mut self) {
        unsafe {
            let pml4 = table(self.root.as_u64());
            if pml4[0].is_present() {
                let pdpt_pa = pml4[0].addr();
                let pdpt = table(pdpt_pa);

                // The user half lives entirely below the PDPT slot covering
                // KERNBASE; the mirrored kernel entries are not ours to free.
                for pdpe_idx in 0..pdpx(KERNBASE) {
                    if !pdpt[pdpe_idx].is_present() {
                        continue;
                    }
                    let pd_pa = pdpt[pdpe_idx].addr();
                    let pd = table(pd_pa);
                    for pd_idx in 0..NPTENTRIES {
                        if !pd[pd_idx].is_present() {
                            continue;
                        }
                        let pt_pa = pd[pd_idx].addr();
                        let pt = table(pt_pa);
                        for pt_idx in 0..NPTENTRIES {
                            let va = pgaddr(0, pdpe_idx, pd_idx, pt_idx);
                            if va >= UTOP {
                                // Shared kernel pages above UTOP carry no
                                // refcount; only the table itself is ours.
                                break;
                            }
                            if pt[pt_idx].is_present() {
                                paging::page_remove(self.root, VirtAddr::new(va));
                            }
                        }
                        pd[pd_idx].clear();
                        phys::page_decref(phys::pa2page(pt_pa));
                    }
                    pdpt[pdpe_idx].clear();
                    phys::page_decref(phys::pa2page(pd_pa));
                }
                pml4[0].clear();
                phys::page_decref(phys::pa2page(pdpt_pa));
            }
        }
        phys::page_decref(phys::pa2page(self.root.as_u64()));
        self.root = PhysAddr::zero();
    }

    /// Allocate and map fresh frames covering [va, va+len), rounded out to
    /// page boundaries, with `perm | USER`. The frames are not zeroed.
    ///
    /// Only used for kernel-controlled setup (program loading); allocation
    /// failure is fatal.
    pub fn region_alloc(&mut self, va: u64, len: u64, perm: PteFlags) {
        let start = round_down(va, PGSIZE);
        let end = round_up(va + len, PGSIZE);
        let mut addr = start;
        while addr < end {
            let Some(pp) = phys::page_alloc(AllocFlags::empty()) else {
                panic!("region_alloc: out of memory at va {:#x}", addr);
            };
            if paging::page_insert(self.root, pp, VirtAddr::new(addr), perm | PteFlags::USER)
                .is_err()
            {
                panic!("region_alloc: page table allocation failed at va {:#x}", addr);
            }
            addr += PGSIZE;
        }
    }
}

/// Check that [va, va+len) is mapped in `root` with at least `perm` (plus
/// PRESENT), entirely below ULIM. On failure returns the first offending
/// address, clamped to `va` for the leading partial page.
pub fn user_mem_check(root: PhysAddr, va: u64, len: u64, perm: PteFlags) -> Result<(), u64> {
    let need = perm | PteFlags::PRESENT;
    let end = va.checked_add(len).ok_or(va)?;
    let mut page = round_down(va, PGSIZE);
    while page < end {
        let fault_va = page.max(va);
        if page >= ULIM {
            return Err(fault_va);
        }
        match paging::page_lookup(root, VirtAddr::new(page)) {
            Some((_, pte)) => {
                if !unsafe { (*pte).flags() }.contains(need) {
                    return Err(fault_va);
                }
            }
            None => return Err(fault_va),
        }
        page += PGSIZE;
    }
    Ok(())
}
