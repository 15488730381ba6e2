/*
 * Boot Handoff
 *
 * The UEFI bootloader exits boot services and calls the kernel entry with a
 * pointer to this structure: the firmware memory map (an array of descriptors
 * whose stride is `desc_size`, not `size_of::<MemoryDescriptor>()`), plus the
 * ACPI RSDP it found in the EFI configuration table.
 */

/// UEFI memory type for usable conventional RAM
pub const EFI_CONVENTIONAL_MEMORY: u32 = 7;
/// Memory the bootloader used for the kernel image and its own data;
/// reclaimable, but we treat it as reserved until the frame table is up.
pub const EFI_LOADER_CODE: u32 = 1;
pub const EFI_LOADER_DATA: u32 = 2;
pub const EFI_BOOT_SERVICES_CODE: u32 = 3;
pub const EFI_BOOT_SERVICES_DATA: u32 = 4;

/// One UEFI memory map descriptor (EFI_MEMORY_DESCRIPTOR)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    pub typ: u32,
    pub pad: u32,
    pub phys_start: u64,
    pub virt_start: u64,
    pub num_pages: u64,
    pub attribute: u64,
}

/// Handoff record passed by the bootloader to the kernel entry point
#[repr(C)]
pub struct BootInfo {
    /// Physical pointer to the first memory descriptor
    pub mem_map: *const MemoryDescriptor,
    /// Total size of the memory map in bytes
    pub map_size: usize,
    /// Stride between descriptors in bytes (>= size_of::<MemoryDescriptor>())
    pub map_desc_size: usize,
    /// ACPI RSDP, as found in the EFI configuration table
    pub rsdp: u64,
}

impl BootInfo {
    /// Iterate the firmware memory map, honoring the descriptor stride.
    pub fn memory_map(&self) -> MemoryMapIter<'_> {
        MemoryMapIter {
            info: self,
            offset: 0,
        }
    }
}

pub struct MemoryMapIter<'a> {
    info: &'a BootInfo,
    offset: usize,
}

impl<'a> Iterator for MemoryMapIter<'a> {
    type Item = MemoryDescriptor;

    fn next(&mut self) -> Option<MemoryDescriptor> {
        if self.offset + self.info.map_desc_size > self.info.map_size {
            return None;
        }
        // The stride comes from firmware; descriptors may carry vendor tail
        // bytes, so read at the advertised offset rather than indexing.
        let ptr = unsafe {
            (self.info.mem_map as *const u8).add(self.offset) as *const MemoryDescriptor
        };
        self.offset += self.info.map_desc_size;
        Some(unsafe { core::ptr::read_unaligned(ptr) })
    }
}
