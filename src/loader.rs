/*
 * ELF Program Loader
 *
 * Materialises a 64-bit little-endian ELF executable into an environment's
 * address space: every PT_LOAD segment gets fresh frames at its declared
 * virtual address, file bytes are copied in, the memsz tail beyond filesz is
 * zeroed, and one page of stack is mapped below USTACKTOP. Copying happens
 * with the target address space loaded on CR3, since the destination
 * addresses only exist there; the kernel root is restored on the way out.
 */

use alloc::vec::Vec;

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;

use crate::env::Env;
use crate::memory::kern_pml4;
use crate::memory::layout::{PGSIZE, USTACKTOP, UTOP};
use crate::memory::paging::PteFlags;

/// ELF magic number (0x7F 'E' 'L' 'F')
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF class (64-bit)
const ELFCLASS64: u8 = 2;

/// ELF data encoding (little-endian)
const ELFDATA2LSB: u8 = 1;

/// ELF type: executable file
const ET_EXEC: u16 = 2;

/// ELF machine: AMD x86-64
const EM_X86_64: u16 = 62;

/// Program header type: loadable segment
const PT_LOAD: u32 = 1;

/// ELF64 header (64 bytes)
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Elf64Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// ELF64 program header (56 bytes)
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    InvalidMagic,
    InvalidClass,
    InvalidEncoding,
    InvalidType,
    InvalidMachine,
    InvalidHeader,
    SegmentOutOfRange,
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LoadError::InvalidMagic => write!(f, "invalid ELF magic number"),
            LoadError::InvalidClass => write!(f, "not a 64-bit ELF"),
            LoadError::InvalidEncoding => write!(f, "not little-endian"),
            LoadError::InvalidType => write!(f, "not an executable"),
            LoadError::InvalidMachine => write!(f, "not an x86-64 binary"),
            LoadError::InvalidHeader => write!(f, "malformed ELF header"),
            LoadError::SegmentOutOfRange => write!(f, "segment outside user memory"),
        }
    }
}

fn parse_header(data: &[u8]) -> Result<Elf64Header, LoadError> {
    if data.len() < core::mem::size_of::<Elf64Header>() {
        return Err(LoadError::InvalidHeader);
    }

    // Packed struct: go through read_unaligned, never references.
    let header = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };

    if header.e_ident[0..4] != ELF_MAGIC {
        return Err(LoadError::InvalidMagic);
    }
    if header.e_ident[4] != ELFCLASS64 {
        return Err(LoadError::InvalidClass);
    }
    if header.e_ident[5] != ELFDATA2LSB {
        return Err(LoadError::InvalidEncoding);
    }

    let e_type = unsafe { core::ptr::addr_of!(header.e_type).read_unaligned() };
    if e_type != ET_EXEC {
        return Err(LoadError::InvalidType);
    }
    let e_machine = unsafe { core::ptr::addr_of!(header.e_machine).read_unaligned() };
    if e_machine != EM_X86_64 {
        return Err(LoadError::InvalidMachine);
    }

    Ok(header)
}

fn parse_program_headers(
    data: &[u8],
    header: &Elf64Header,
) -> Result<Vec<Elf64ProgramHeader>, LoadError> {
    let ph_offset = unsafe { core::ptr::addr_of!(header.e_phoff).read_unaligned() } as usize;
    let ph_size = unsafe { core::ptr::addr_of!(header.e_phentsize).read_unaligned() } as usize;
    let ph_count = unsafe { core::ptr::addr_of!(header.e_phnum).read_unaligned() } as usize;

    if ph_size < core::mem::size_of::<Elf64ProgramHeader>()
        || ph_offset
            .checked_add(ph_size.checked_mul(ph_count).ok_or(LoadError::InvalidHeader)?)
            .ok_or(LoadError::InvalidHeader)?
            > data.len()
    {
        return Err(LoadError::InvalidHeader);
    }

    let mut headers = Vec::with_capacity(ph_count);
    for i in 0..ph_count {
        let offset = ph_offset + i * ph_size;
        let ph = unsafe {
            core::ptr::read_unaligned(data[offset..].as_ptr() as *const Elf64ProgramHeader)
        };
        headers.push(ph);
    }
    Ok(headers)
}

/// Load `binary` into `e`'s address space and point its saved rip at the
/// entry point. Also maps the initial user stack page.
pub fn load_image(e: &mut Env, binary: &[u8]) -> Result<(), LoadError> {
    let header = parse_header(binary)?;
    let entry = unsafe { core::ptr::addr_of!(header.e_entry).read_unaligned() };
    let program_headers = parse_program_headers(binary, &header)?;

    let mut aspace = e.address_space();

    // The segment destinations only exist in the target address space.
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(aspace.root),
            Cr3Flags::empty(),
        );
    }

    let mut loaded = 0;
    for ph in &program_headers {
        let p_type = unsafe { core::ptr::addr_of!(ph.p_type).read_unaligned() };
        if p_type != PT_LOAD {
            continue;
        }

        let vaddr = unsafe { core::ptr::addr_of!(ph.p_vaddr).read_unaligned() };
        let offset = unsafe { core::ptr::addr_of!(ph.p_offset).read_unaligned() } as usize;
        let filesz = unsafe { core::ptr::addr_of!(ph.p_filesz).read_unaligned() } as usize;
        let memsz = unsafe { core::ptr::addr_of!(ph.p_memsz).read_unaligned() } as usize;

        if filesz > memsz
            || offset.checked_add(filesz).ok_or(LoadError::InvalidHeader)? > binary.len()
        {
            restore_kernel_cr3();
            return Err(LoadError::InvalidHeader);
        }
        if vaddr.checked_add(memsz as u64).is_none_or(|end| end > UTOP) {
            restore_kernel_cr3();
            return Err(LoadError::SegmentOutOfRange);
        }

        aspace.region_alloc(vaddr, memsz as u64, PteFlags::WRITABLE);
        unsafe {
            core::ptr::copy_nonoverlapping(binary.as_ptr().add(offset), vaddr as *mut u8, filesz);
            core::ptr::write_bytes((vaddr as *mut u8).add(filesz), 0, memsz - filesz);
        }

        log::info!(
            "loader: segment at {:#x}, filesz {:#x}, memsz {:#x}",
            vaddr,
            filesz,
            memsz
        );
        loaded += 1;
    }

    if loaded == 0 {
        restore_kernel_cr3();
        return Err(LoadError::InvalidHeader);
    }

    e.env_tf.rip = entry;

    // One page of initial stack.
    aspace.region_alloc(USTACKTOP - PGSIZE, PGSIZE, PteFlags::WRITABLE);

    restore_kernel_cr3();
    Ok(())
}

fn restore_kernel_cr3() {
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(kern_pml4()),
            Cr3Flags::empty(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_elf(machine: u16, class: u8) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = class;
        bytes[5] = ELFDATA2LSB;
        bytes[6] = 1; // EV_CURRENT
        bytes[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        bytes[18..20].copy_from_slice(&machine.to_le_bytes());
        bytes
    }

    #[test]
    fn header_validation() {
        assert!(parse_header(&minimal_elf(EM_X86_64, ELFCLASS64)).is_ok());

        let mut bad_magic = minimal_elf(EM_X86_64, ELFCLASS64);
        bad_magic[0] = 0;
        assert!(matches!(
            parse_header(&bad_magic),
            Err(LoadError::InvalidMagic)
        ));

        assert!(matches!(
            parse_header(&minimal_elf(EM_X86_64, 1)),
            Err(LoadError::InvalidClass)
        ));
        assert!(matches!(
            parse_header(&minimal_elf(40, ELFCLASS64)),
            Err(LoadError::InvalidMachine)
        ));
        assert!(matches!(
            parse_header(&[0u8; 10]),
            Err(LoadError::InvalidHeader)
        ));
    }
}
