/*
 * Kernel Heap
 *
 * A small fixed-size heap backing the alloc crate (the loader's scratch
 * vectors, mostly). Lives in otherwise-unused kernel VA space far above the
 * direct map, backed by frames taken from the page allocator and pinned
 * with a refcount so the frame-table invariants keep holding.
 */

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;
use x86_64::VirtAddr;

use crate::memory::layout::PGSIZE;
use crate::memory::paging::{self, PteFlags};
use crate::memory::phys::{self, AllocFlags};
use crate::memory::kern_pml4;

/// Virtual base of the kernel heap, far above any plausible direct map
pub const HEAP_START: u64 = 0x70_0000_0000;
/// Heap size in bytes
pub const HEAP_SIZE: u64 = 1024 * 1024;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Map and initialize the heap. Called once, after the frame allocator and
/// the kernel address space are up.
pub fn init() {
    let pages = HEAP_SIZE / PGSIZE;
    for i in 0..pages {
        let va = VirtAddr::new(HEAP_START + i * PGSIZE);
        let pp = phys::page_alloc(AllocFlags::ZERO).expect("heap: out of memory");
        // Kernel-global mapping: pin the frame explicitly since mappings
        // above the user cutoff carry no refcount of their own.
        pp.pp_ref += 1;
        let pte = paging::pml4_walk(kern_pml4(), va, true).expect("heap: out of memory");
        unsafe {
            (*pte).set(
                phys::page2pa(pp),
                PteFlags::PRESENT | PteFlags::WRITABLE,
            );
        }
    }

    #[cfg(not(test))]
    unsafe {
        ALLOCATOR
            .lock()
            .init(HEAP_START as *mut u8, HEAP_SIZE as usize);
    }

    log::info!(
        "Kernel heap at {:#x}, {} KiB",
        HEAP_START,
        HEAP_SIZE / 1024
    );
}

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}
