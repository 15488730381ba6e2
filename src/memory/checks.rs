/*
 * Boot-Time Memory Self Checks
 *
 * Exercises the frame allocator and the page-table operations against the
 * live kernel address space, right after it is installed. The checks pull
 * the free list out from under the allocator to force deterministic
 * allocation order, so they must run before anything else is using it.
 */

use x86_64::VirtAddr;

use crate::memory::layout::*;
use crate::memory::paging::{self, page_insert, page_lookup, page_remove, pml4_walk, PteFlags};
use crate::memory::phys::{self, page2kva, page2pa, AllocFlags};
use crate::memory::{kaddr, kern_pml4, paddr};

pub fn run() {
    check_page_free_list();
    check_page_alloc();
    check_page();
    check_page_installed();
}

/// Physical address `va` maps to in the kernel root, by a software walk.
fn check_va2pa(va: u64) -> Option<u64> {
    let pte = pml4_walk(kern_pml4(), VirtAddr::new(va), false)?;
    unsafe {
        if !(*pte).is_present() {
            return None;
        }
        Some((*pte).addr())
    }
}

fn free_count() -> usize {
    let mut n = 0;
    let mut idx = phys::free_list_head();
    while idx != phys::nil() {
        n += 1;
        idx = phys::pages()[idx as usize].pp_link;
    }
    n
}

/// Every frame on the free list is usable RAM with no references.
fn check_page_free_list() {
    let first_free_pa = paddr(phys::boot_alloc(0) as u64);

    assert!(phys::free_list_head() != phys::nil(), "free list is empty");

    let mut idx = phys::free_list_head();
    while idx != phys::nil() {
        let pp = &phys::pages()[idx as usize];
        let pa = (idx as u64) * PGSIZE;

        assert_ne!(pa, 0);
        assert_ne!(pa, MPENTRY_PADDR);
        assert!(!(IOPHYSMEM..EXTPHYSMEM).contains(&pa));
        assert!(!(EXTPHYSMEM..first_free_pa).contains(&pa));
        assert_eq!(pp.pp_ref, 0);

        idx = pp.pp_link;
    }

    log::info!("check_page_free_list() succeeded!");
}

/// page_alloc / page_free / the ZERO flag.
fn check_page_alloc() {
    let nfree = free_count();

    let pp0 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let pp1 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let pp2 = phys::page_alloc(AllocFlags::empty()).unwrap();

    let (pa0, pa1, pa2) = (page2pa(pp0), page2pa(pp1), page2pa(pp2));
    assert_ne!(pa0, pa1);
    assert_ne!(pa1, pa2);
    assert_ne!(pa0, pa2);
    assert!(pa0 < phys::npages() as u64 * PGSIZE);
    assert!(pa1 < phys::npages() as u64 * PGSIZE);
    assert!(pa2 < phys::npages() as u64 * PGSIZE);

    // Temporarily steal the rest of the free list.
    let fl = phys::free_list_head();
    phys::set_free_list_head(phys::nil());
    assert!(phys::page_alloc(AllocFlags::empty()).is_none());

    // Free and re-allocate; the same three frames come back.
    phys::page_free(pp0);
    phys::page_free(pp1);
    phys::page_free(pp2);
    let pp0 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let pp1 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let pp2 = phys::page_alloc(AllocFlags::empty()).unwrap();
    assert!(phys::page_alloc(AllocFlags::empty()).is_none());

    // The ZERO flag really zeroes.
    unsafe { core::ptr::write_bytes(page2kva(pp0), 1, PGSIZE as usize) };
    let pa0 = page2pa(pp0);
    phys::page_free(pp0);
    let pp = phys::page_alloc(AllocFlags::ZERO).unwrap();
    assert_eq!(page2pa(pp), pa0);
    let kva = page2kva(pp);
    for i in 0..PGSIZE as usize {
        assert_eq!(unsafe { *kva.add(i) }, 0);
    }

    // Give the free list back and return what we took.
    phys::set_free_list_head(fl);
    phys::page_free(pp);
    phys::page_free(pp1);
    phys::page_free(pp2);

    assert_eq!(free_count(), nfree);

    log::info!("check_page_alloc() succeeded!");
}

unsafe fn pte_table<'a>(pa: u64) -> &'a mut [paging::Pte; NPTENTRIES] {
    unsafe { &mut *(kaddr(pa) as *mut [paging::Pte; NPTENTRIES]) }
}

/// page_insert / page_remove / page_lookup and their refcount laws.
fn check_page() {
    let root = kern_pml4();
    let nfree = free_count();

    let pp0 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let pp1 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let pp2 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let pp3 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let pp4 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let (pa0, pa1, pa2, pa3, pa4) =
        (page2pa(pp0), page2pa(pp1), page2pa(pp2), page2pa(pp3), page2pa(pp4));

    // Steal the free list so allocation behavior is deterministic.
    let fl = phys::free_list_head();
    phys::set_free_list_head(phys::nil());
    assert!(phys::page_alloc(AllocFlags::empty()).is_none());

    // Nothing is mapped at VA 0, and with no free frames for intermediate
    // tables an insert there must fail.
    assert!(page_lookup(root, VirtAddr::new(0)).is_none());
    assert!(page_insert(root, phys::pa2page(pa1), VirtAddr::new(0), PteFlags::empty()).is_err());

    // One freed frame buys the page directory, but not the page table.
    phys::page_free(phys::pa2page(pa0));
    assert!(page_insert(root, phys::pa2page(pa1), VirtAddr::new(0), PteFlags::empty()).is_err());
    // A second frees the way.
    phys::page_free(phys::pa2page(pa2));
    assert!(page_insert(root, phys::pa2page(pa1), VirtAddr::new(0), PteFlags::empty()).is_ok());

    assert_eq!(check_va2pa(0), Some(pa1));
    assert_eq!(phys::pa2page(pa1).pp_ref, 1);
    assert_eq!(phys::pa2page(pa0).pp_ref, 1); // consumed as page directory
    assert_eq!(phys::pa2page(pa2).pp_ref, 1); // consumed as page table

    // A second leaf in the same page table needs no fresh frames.
    assert!(page_insert(root, phys::pa2page(pa3), VirtAddr::new(PGSIZE), PteFlags::empty()).is_ok());
    assert_eq!(check_va2pa(PGSIZE), Some(pa3));
    assert_eq!(phys::pa2page(pa3).pp_ref, 1);
    assert!(phys::page_alloc(AllocFlags::empty()).is_none());

    // Law: re-inserting the same frame at the same VA leaves the refcount
    // unchanged and frees nothing.
    assert!(page_insert(root, phys::pa2page(pa3), VirtAddr::new(PGSIZE), PteFlags::empty()).is_ok());
    assert_eq!(phys::pa2page(pa3).pp_ref, 1);
    assert!(phys::page_alloc(AllocFlags::empty()).is_none());

    // Law: re-insertion updates permissions in place.
    assert!(page_insert(root, phys::pa2page(pa3), VirtAddr::new(PGSIZE), PteFlags::USER).is_ok());
    assert_eq!(phys::pa2page(pa3).pp_ref, 1);
    let pte = pml4_walk(root, VirtAddr::new(PGSIZE), false).unwrap();
    assert!(unsafe { (*pte).flags() }.contains(PteFlags::USER));

    // A mapping in the next 2 MiB region needs a page table we cannot get.
    assert!(page_insert(root, phys::pa2page(pa0), VirtAddr::new(PTSIZE), PteFlags::empty()).is_err());

    // Replacing a mapping drops the old frame.
    assert!(page_insert(root, phys::pa2page(pa1), VirtAddr::new(PGSIZE), PteFlags::empty()).is_ok());
    assert_eq!(check_va2pa(0), Some(pa1));
    assert_eq!(check_va2pa(PGSIZE), Some(pa1));
    assert_eq!(phys::pa2page(pa1).pp_ref, 2);
    assert_eq!(phys::pa2page(pa3).pp_ref, 0);
    // ...onto the free list, whence we reclaim it to keep our accounting.
    let reclaimed = phys::page_alloc(AllocFlags::empty()).unwrap();
    assert_eq!(page2pa(reclaimed), pa3);
    assert!(phys::page_alloc(AllocFlags::empty()).is_none());

    // Law: insert/remove round-trips refcounts to zero.
    page_remove(root, VirtAddr::new(0));
    assert_eq!(check_va2pa(0), None);
    assert_eq!(check_va2pa(PGSIZE), Some(pa1));
    assert_eq!(phys::pa2page(pa1).pp_ref, 1);

    page_remove(root, VirtAddr::new(PGSIZE));
    assert_eq!(check_va2pa(PGSIZE), None);
    assert_eq!(phys::pa2page(pa1).pp_ref, 0);
    let reclaimed1 = phys::page_alloc(AllocFlags::empty()).unwrap();
    assert_eq!(page2pa(reclaimed1), pa1);
    assert!(phys::page_alloc(AllocFlags::empty()).is_none());

    // Removing an unmapped page is a silent no-op.
    page_remove(root, VirtAddr::new(0));

    // Tear the test page tables back out of the kernel root.
    unsafe {
        let pml4 = pte_table(root.as_u64());
        let pdpt = pte_table(pml4[0].addr());
        let pd = pte_table(pdpt[0].addr());
        assert_eq!(pd[0].addr(), pa2);
        pd[0].clear();
        phys::page_decref(phys::pa2page(pa2));
        assert_eq!(pdpt[0].addr(), pa0);
        pdpt[0].clear();
        phys::page_decref(phys::pa2page(pa0));
    }
    let reclaimed2 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let reclaimed3 = phys::page_alloc(AllocFlags::empty()).unwrap();
    assert_eq!(page2pa(reclaimed2), pa0);
    assert_eq!(page2pa(reclaimed3), pa2);
    assert!(phys::page_alloc(AllocFlags::empty()).is_none());

    // Restore the world.
    phys::set_free_list_head(fl);
    for pa in [pa0, pa1, pa2, pa3, pa4] {
        phys::page_free(phys::pa2page(pa));
    }
    assert_eq!(free_count(), nfree);

    log::info!("check_page() succeeded!");
}

/// Mappings are live: reads and writes through freshly inserted pages hit
/// the backing frames.
fn check_page_installed() {
    let root = kern_pml4();

    let pp1 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let pp2 = phys::page_alloc(AllocFlags::empty()).unwrap();
    let (pa1, pa2) = (page2pa(pp1), page2pa(pp2));

    unsafe {
        core::ptr::write_bytes(page2kva(pp1), 1, PGSIZE as usize);
        core::ptr::write_bytes(page2kva(pp2), 2, PGSIZE as usize);
    }

    page_insert(root, phys::pa2page(pa1), VirtAddr::new(PGSIZE), PteFlags::WRITABLE).unwrap();
    assert_eq!(phys::pa2page(pa1).pp_ref, 1);
    assert_eq!(unsafe { *(PGSIZE as *const u32) }, 0x0101_0101);

    page_insert(root, phys::pa2page(pa2), VirtAddr::new(PGSIZE), PteFlags::WRITABLE).unwrap();
    assert_eq!(unsafe { *(PGSIZE as *const u32) }, 0x0202_0202);
    assert_eq!(phys::pa2page(pa2).pp_ref, 1);
    assert_eq!(phys::pa2page(pa1).pp_ref, 0);

    unsafe { *(PGSIZE as *mut u32) = 0x0303_0303 };
    assert_eq!(unsafe { *(page2kva(phys::pa2page(pa2)) as *const u32) }, 0x0303_0303);

    page_remove(root, VirtAddr::new(PGSIZE));
    assert_eq!(phys::pa2page(pa2).pp_ref, 0);

    // pp1 went back to the free list when it was replaced; pp2 when it was
    // removed. Nothing left to clean up but the table pages, which stay.

    log::info!("check_page_installed() succeeded!");
}
