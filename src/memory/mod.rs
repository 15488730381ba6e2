/*
 * Memory Management
 *
 * Orchestrates bring-up of the physical allocator and the kernel address
 * space:
 *
 *   1. Size RAM from the UEFI map; carve the frame table, the environment
 *      table, and the kernel PML4 out of boot_alloc memory.
 *   2. Seed the frame free list.
 *   3. Build the kernel side of virtual memory: the read-only UPAGES/UENVS
 *      windows, the direct map of all RAM at KERNBASE, the per-CPU kernel
 *      stacks, and the PML4 self-map.
 *   4. Switch CR3 to the new root and (optionally) run the self checks.
 *
 * The KERNBASE direct map is what lets the rest of the kernel touch
 * arbitrary physical frames: kaddr/paddr translate in O(1) and page tables
 * of any address space are edited through it, no CR3 switching required.
 */

pub mod address_space;
#[cfg(feature = "selfcheck")]
pub mod checks;
pub mod heap;
pub mod layout;
pub mod paging;
pub mod phys;

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use crate::bootinfo::BootInfo;
use crate::cpu;
use crate::env::{self, Env, NENV};
use crate::memory::layout::*;
use crate::memory::paging::PteFlags;

static mut KERN_PML4: u64 = 0;

/// Physical address of the kernel's PML4.
pub fn kern_pml4() -> PhysAddr {
    PhysAddr::new(unsafe { KERN_PML4 })
}

/// Translate a physical address into the KERNBASE direct map.
pub fn kaddr(pa: u64) -> *mut u8 {
    let n = phys::npages();
    if n != 0 && pa >= n as u64 * PGSIZE {
        panic!("kaddr called with invalid pa {:#x}", pa);
    }
    (pa + KERNBASE) as *mut u8
}

/// Translate a kernel virtual address in the direct map back to physical.
pub fn paddr(kva: u64) -> u64 {
    if kva < KERNBASE {
        panic!("paddr called with invalid kva {:#x}", kva);
    }
    kva - KERNBASE
}

/// Set up all of the above. Runs once on the boot CPU, before anything else
/// touches a page table.
pub fn init(boot_info: &BootInfo) {
    phys::detect_memory(boot_info);

    // The kernel root comes from boot_alloc so it is never on the free list.
    let pml4_kva = phys::boot_alloc(PGSIZE as usize);
    unsafe {
        core::ptr::write_bytes(pml4_kva, 0, PGSIZE as usize);
        KERN_PML4 = paddr(pml4_kva as u64);
    }

    // Environment table, mapped read-only at UENVS below.
    let envs_bytes = NENV * core::mem::size_of::<Env>();
    let envs = phys::boot_alloc(envs_bytes) as *mut Env;
    unsafe { core::ptr::write_bytes(envs as *mut u8, 0, envs_bytes) };
    env::set_table(envs);

    phys::page_init(boot_info);

    let root = kern_pml4();

    // Read-only windows for user mode: the frame table and the env table.
    let pages_pa = paddr(phys::pages().as_ptr() as u64);
    let pages_bytes = phys::npages() * core::mem::size_of::<phys::PageInfo>();
    boot_map_region(UPAGES, round_up(pages_bytes as u64, PGSIZE), pages_pa, PteFlags::USER);
    boot_map_region(UENVS, round_up(envs_bytes as u64, PGSIZE), paddr(envs as u64), PteFlags::USER);

    // Direct map of all RAM.
    boot_map_region(
        KERNBASE,
        phys::npages() as u64 * PGSIZE,
        0,
        PteFlags::WRITABLE,
    );

    // Per-CPU kernel stacks, each below its KSTACKTOP slot with the guard
    // gap left unmapped.
    for i in 0..cpu::NCPU {
        let stack_kva = unsafe { core::ptr::addr_of!(cpu::PERCPU_KSTACKS[i]) as u64 };
        boot_map_region(
            cpu::kstacktop(i) - KSTKSIZE,
            KSTKSIZE,
            paddr(stack_kva),
            PteFlags::WRITABLE,
        );
    }

    // Self-map: the kernel's own tables become readable at UVPT.
    unsafe {
        let pml4 = &mut *(pml4_kva as *mut [paging::Pte; NPTENTRIES]);
        pml4[PML4_SELF_SLOT].set(KERN_PML4, PteFlags::PRESENT | PteFlags::USER);
    }

    unsafe {
        Cr3::write(
            PhysFrame::containing_address(root),
            Cr3Flags::empty(),
        );
    }
    log::info!("Kernel address space installed, root at {:#x}", root.as_u64());

    #[cfg(feature = "selfcheck")]
    checks::run();

    heap::init();
}

/// Map [va, va+size) to [pa, pa+size) in the kernel root with `perm |
/// PRESENT`. Static boot mappings only: leaf refcounts are not maintained.
/// Panics on exhaustion, since the kernel cannot start without them.
pub fn boot_map_region(va: u64, size: u64, pa: u64, perm: PteFlags) {
    assert_eq!(va % PGSIZE, 0);
    assert_eq!(pa % PGSIZE, 0);
    let pages = round_up(size, PGSIZE) / PGSIZE;
    for i in 0..pages {
        let pte = paging::pml4_walk(kern_pml4(), VirtAddr::new(va + i * PGSIZE), true)
            .expect("boot_map_region: out of memory");
        unsafe { (*pte).set(pa + i * PGSIZE, perm | PteFlags::PRESENT) };
    }
}

static mut MMIO_NEXT: u64 = MMIOBASE;

/// Reserve a chunk of the MMIO window and map it at `pa`, uncached.
/// Returns the virtual base of the mapping.
pub fn mmio_map_region(pa: u64, size: u64) -> VirtAddr {
    unsafe {
        let base = MMIO_NEXT;
        let size = round_up(size, PGSIZE);
        if base + size > MMIOLIM {
            panic!("mmio_map_region: window overflow mapping {:#x}", pa);
        }
        // Device memory: write-through and cache-disabled.
        let perm = PteFlags::WRITABLE | PteFlags::WRITE_THROUGH | PteFlags::NO_CACHE;
        let pages = size / PGSIZE;
        for i in 0..pages {
            let pte = paging::pml4_walk(kern_pml4(), VirtAddr::new(base + i * PGSIZE), true)
                .expect("mmio_map_region: out of memory");
            (*pte).set(pa + i * PGSIZE, perm | PteFlags::PRESENT);
        }
        MMIO_NEXT = base + size;
        VirtAddr::new(base)
    }
}
