/*
 * Physical Frame Allocator
 *
 * One PageInfo descriptor per 4 KiB frame of RAM, kept in a dense table that
 * is also mapped read-only into every user address space at UPAGES. Free
 * frames form an intrusive singly-linked list through pp_link; pp_ref counts
 * page-table entries pointing at the frame (mappings in the kernel-global
 * region above UTOP are not counted).
 *
 * Before the free list exists, boot_alloc hands out memory by bumping a
 * pointer past the kernel image; page_init then seeds the free list from the
 * UEFI memory map, excluding frame 0, the legacy I/O hole, the AP bootstrap
 * frame, and everything boot_alloc consumed.
 */

use bitflags::bitflags;

use crate::bootinfo::{BootInfo, EFI_CONVENTIONAL_MEMORY};
use crate::memory::layout::*;
use crate::memory::{kaddr, paddr};

/// Sentinel for "not linked"
const PP_NIL: u32 = u32::MAX;

/// Frame descriptor. The table of these is user-visible at UPAGES, so the
/// layout is fixed.
#[repr(C)]
#[derive(Debug)]
pub struct PageInfo {
    /// Next frame on the free list (index into the table), PP_NIL when the
    /// frame is allocated or is the tail.
    pub pp_link: u32,
    /// Number of page-table entries pointing at this frame
    pub pp_ref: u16,
    pad: u16,
}

bitflags! {
    pub struct AllocFlags: u32 {
        /// Zero the frame before returning it
        const ZERO = 1 << 0;
    }
}

/// The direct map at KERNBASE spans a single PML4 slot's worth of PDPT
/// entries; RAM beyond that cannot be addressed through it.
const MAX_PHYS_PAGES: usize = ((512 * (1 << 30) - KERNBASE) / PGSIZE) as usize;

static mut PAGES: *mut PageInfo = core::ptr::null_mut();
static mut NPAGES: usize = 0;
static mut PAGE_FREE_LIST: u32 = PP_NIL;
static mut NEXTFREE: u64 = 0;

unsafe extern "C" {
    /// End of the kernel image (virtual), provided by the linker script
    static __kernel_end: u8;
}

/// Number of frames under management.
pub fn npages() -> usize {
    unsafe { NPAGES }
}

/// The frame descriptor table.
pub fn pages() -> &'static mut [PageInfo] {
    unsafe { core::slice::from_raw_parts_mut(PAGES, NPAGES) }
}

/// Physical address of the frame `pp` describes.
pub fn page2pa(pp: &PageInfo) -> u64 {
    let idx = (pp as *const PageInfo as usize - unsafe { PAGES } as usize)
        / core::mem::size_of::<PageInfo>();
    (idx as u64) << PGSHIFT
}

/// Descriptor for the frame containing physical address `pa`.
pub fn pa2page(pa: u64) -> &'static mut PageInfo {
    let idx = (pa >> PGSHIFT) as usize;
    if idx >= npages() {
        panic!("pa2page called with invalid pa {:#x}", pa);
    }
    unsafe { &mut *PAGES.add(idx) }
}

/// Kernel virtual address of the frame `pp` describes.
pub fn page2kva(pp: &PageInfo) -> *mut u8 {
    kaddr(page2pa(pp))
}

/// Boot-time bump allocator. `n == 0` returns the current break without
/// allocating. Only valid until page_init seeds the free list.
pub fn boot_alloc(n: usize) -> *mut u8 {
    unsafe {
        if NEXTFREE == 0 {
            NEXTFREE = round_up(core::ptr::addr_of!(__kernel_end) as u64, PGSIZE);
        }
        let result = NEXTFREE;
        NEXTFREE = round_up(NEXTFREE + n as u64, PGSIZE);
        result as *mut u8
    }
}

/// Size physical memory from the firmware map and carve out the frame table.
pub fn detect_memory(boot_info: &BootInfo) {
    let mut top: u64 = 0;
    for desc in boot_info.memory_map() {
        if desc.typ == EFI_CONVENTIONAL_MEMORY {
            top = top.max(desc.phys_start + desc.num_pages * PGSIZE);
        }
    }
    let npages = ((top / PGSIZE) as usize).min(MAX_PHYS_PAGES);

    log::info!(
        "Physical memory: {} KiB in {} frames",
        npages as u64 * PGSIZE / 1024,
        npages
    );

    let table = boot_alloc(npages * core::mem::size_of::<PageInfo>()) as *mut PageInfo;
    unsafe {
        core::ptr::write_bytes(table, 0, npages);
        PAGES = table;
        NPAGES = npages;
    }
}

/// Seed the free list from the UEFI memory map. Frames excluded: frame 0,
/// the 640K-1M legacy hole, the AP bootstrap frame, the kernel image, and
/// everything boot_alloc handed out.
pub fn page_init(boot_info: &BootInfo) {
    let first_free_pa = paddr(boot_alloc(0) as u64);

    // Everything starts out "in use": pp_ref 0, not linked.
    for pp in pages().iter_mut() {
        pp.pp_link = PP_NIL;
        pp.pp_ref = 0;
    }

    let mut nfree = 0usize;
    for desc in boot_info.memory_map() {
        if desc.typ != EFI_CONVENTIONAL_MEMORY {
            continue;
        }
        let start = desc.phys_start / PGSIZE;
        let end = start + desc.num_pages;
        for frame in start..end {
            if frame as usize >= npages() {
                break;
            }
            let pa = frame * PGSIZE;
            if pa == 0 || pa == MPENTRY_PADDR {
                continue;
            }
            if (IOPHYSMEM..EXTPHYSMEM).contains(&pa) {
                continue;
            }
            if (EXTPHYSMEM..first_free_pa).contains(&pa) {
                continue;
            }
            free_list_push(frame as u32);
            nfree += 1;
        }
    }

    log::info!("Frame free list seeded: {} frames free", nfree);
}

fn free_list_push(idx: u32) {
    unsafe {
        let pp = &mut *PAGES.add(idx as usize);
        pp.pp_link = PAGE_FREE_LIST;
        PAGE_FREE_LIST = idx;
    }
}

/// Allocate a physical frame. The returned frame has pp_ref == 0; the caller
/// increments it when installing a mapping. Returns None when memory is
/// exhausted.
pub fn page_alloc(flags: AllocFlags) -> Option<&'static mut PageInfo> {
    unsafe {
        if PAGE_FREE_LIST == PP_NIL {
            return None;
        }
        let idx = PAGE_FREE_LIST;
        let pp = &mut *PAGES.add(idx as usize);
        PAGE_FREE_LIST = pp.pp_link;
        pp.pp_link = PP_NIL;

        if flags.contains(AllocFlags::ZERO) {
            core::ptr::write_bytes(page2kva(pp), 0, PGSIZE as usize);
        }
        Some(pp)
    }
}

/// Return a frame to the free list. pp_ref must be zero and the frame must
/// not already be linked; either violation is a kernel bug.
pub fn page_free(pp: &mut PageInfo) {
    if pp.pp_ref != 0 {
        panic!("page_free: pa {:#x} has pp_ref {}", page2pa(pp), pp.pp_ref);
    }
    if pp.pp_link != PP_NIL {
        panic!("page_free: pa {:#x} is already on the free list", page2pa(pp));
    }
    let idx = (page2pa(pp) >> PGSHIFT) as u32;
    free_list_push(idx);
}

/// Drop one reference; frees the frame when the count reaches zero.
pub fn page_decref(pp: &mut PageInfo) {
    if pp.pp_ref == 0 {
        panic!("page_decref: pa {:#x} refcount underflow", page2pa(pp));
    }
    pp.pp_ref -= 1;
    if pp.pp_ref == 0 {
        page_free(pp);
    }
}

// Free-list surgery hooks for the boot-time self checks.

#[cfg(feature = "selfcheck")]
pub(crate) fn free_list_head() -> u32 {
    unsafe { PAGE_FREE_LIST }
}

#[cfg(feature = "selfcheck")]
pub(crate) fn set_free_list_head(head: u32) {
    unsafe { PAGE_FREE_LIST = head }
}

#[cfg(feature = "selfcheck")]
pub(crate) const fn nil() -> u32 {
    PP_NIL
}
