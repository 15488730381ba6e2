/*
 * ACPI Table Walk
 *
 * Minimal ACPI support for SMP discovery: follow the RSDP the bootloader
 * found to the XSDT, locate the MADT, record the LAPIC base address, and
 * count the enabled processors. Finishes by switching the IMCR from PIC
 * mode to symmetric I/O mode so interrupts flow through the APICs.
 */

use x86_64::instructions::port::Port;

use crate::cpu;
use crate::memory::kaddr;

/// MADT entry type: processor local APIC
const MADT_LAPIC: u8 = 0;

#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
    // ACPI 2.0+
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[repr(C, packed)]
struct Madt {
    header: SdtHeader,
    lapic_address: u32,
    flags: u32,
    // Variable-length entries follow
}

#[repr(C, packed)]
struct MadtEntryHeader {
    typ: u8,
    length: u8,
}

#[repr(C, packed)]
struct MadtLapicEntry {
    header: MadtEntryHeader,
    acpi_cpu_id: u8,
    apic_id: u8,
    flags: u32,
}

/// Find an SDT by signature among the XSDT's 64-bit pointers.
unsafe fn find_sdt(xsdt: *const SdtHeader, signature: &[u8; 4]) -> Option<*const SdtHeader> {
    unsafe {
        let length = core::ptr::addr_of!((*xsdt).length).read_unaligned() as usize;
        let entries = (length - core::mem::size_of::<SdtHeader>()) / 8;
        let pointers = (xsdt as *const u8).add(core::mem::size_of::<SdtHeader>()) as *const u8;

        for i in 0..entries {
            let pa = (pointers.add(i * 8) as *const u64).read_unaligned();
            let sdt = kaddr(pa) as *const SdtHeader;
            if core::ptr::addr_of!((*sdt).signature).read_unaligned() == *signature {
                return Some(sdt);
            }
        }
        None
    }
}

/// Walk RSDP -> XSDT -> MADT. Returns the LAPIC physical base; records the
/// number of usable CPUs in the per-CPU module.
pub fn mp_init(rsdp_pa: u64) -> u64 {
    unsafe {
        let rsdp = kaddr(rsdp_pa) as *const Rsdp;
        let revision = core::ptr::addr_of!((*rsdp).revision).read_unaligned();
        if &core::ptr::addr_of!((*rsdp).signature).read_unaligned() != b"RSD PTR " {
            panic!("mp_init: bad RSDP signature at {:#x}", rsdp_pa);
        }
        log::info!("ACPI revision {} tables at {:#x}", revision, rsdp_pa);

        let xsdt_pa = core::ptr::addr_of!((*rsdp).xsdt_address).read_unaligned();
        let xsdt = kaddr(xsdt_pa) as *const SdtHeader;

        let Some(madt) = find_sdt(xsdt, b"APIC") else {
            log::warn!("ACPI: no MADT found, assuming one CPU");
            cpu::set_ncpu(1);
            return 0xfee0_0000;
        };
        let madt = madt as *const Madt;
        let lapic_pa = core::ptr::addr_of!((*madt).lapic_address).read_unaligned() as u64;

        // Count enabled processors.
        let mut ncpu = 0usize;
        let madt_len = core::ptr::addr_of!((*madt).header.length).read_unaligned() as usize;
        let mut entry = (madt as *const u8).add(core::mem::size_of::<Madt>());
        let end = (madt as *const u8).add(madt_len);
        while entry < end {
            let header = entry as *const MadtEntryHeader;
            let typ = core::ptr::addr_of!((*header).typ).read_unaligned();
            let length = core::ptr::addr_of!((*header).length).read_unaligned() as usize;
            if length == 0 {
                break;
            }

            if typ == MADT_LAPIC {
                let lapic = entry as *const MadtLapicEntry;
                let flags = core::ptr::addr_of!((*lapic).flags).read_unaligned();
                let apic_id = core::ptr::addr_of!((*lapic).apic_id).read_unaligned();
                if flags & 1 != 0 {
                    if ncpu < cpu::NCPU {
                        cpu::cpu(ncpu).cpu_id = ncpu as u32;
                        ncpu += 1;
                    } else {
                        log::warn!("SMP: too many CPUs, CPU {} disabled", apic_id);
                    }
                }
            }
            entry = entry.add(length);
        }

        cpu::set_ncpu(ncpu.max(1));
        cpu::thiscpu()
            .cpu_status
            .store(cpu::CPU_STARTED, core::sync::atomic::Ordering::SeqCst);
        log::info!("SMP: {} CPU(s) found, LAPIC at {:#x}", cpu::ncpu(), lapic_pa);

        // [MP 3.2.6.1] Switch the IMCR from PIC mode to symmetric I/O mode.
        let mut imcr_select: Port<u8> = Port::new(0x22);
        let mut imcr_data: Port<u8> = Port::new(0x23);
        imcr_select.write(0x70);
        let value = imcr_data.read();
        imcr_data.write(value | 1);

        lapic_pa
    }
}
