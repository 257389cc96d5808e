//! # ELF32 container format
//!
//! Just enough of the 32-bit little-endian ARM ELF format to load a shared
//! object: file header, program and section headers, dynamic entries, symbols
//! and REL relocations.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::LoadError;

// =============================================================================
// Identification
// =============================================================================

/// ELF magic number.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Size of `e_ident`.
pub const EI_NIDENT: usize = 16;

/// ELF class: 32-bit.
pub const ELFCLASS32: u8 = 1;

/// ELF data: little-endian.
pub const ELFDATA2LSB: u8 = 1;

/// ELF type: shared object.
pub const ET_DYN: u16 = 3;

/// Machine type: ARM.
pub const EM_ARM: u16 = 40;

// =============================================================================
// Headers
// =============================================================================

/// ELF32 file header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf32Header {
    /// Magic number and identification.
    pub e_ident: [u8; EI_NIDENT],
    /// Object file type.
    pub e_type: u16,
    /// Machine architecture.
    pub e_machine: u16,
    /// Object file version.
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u32,
    /// Program header table file offset.
    pub e_phoff: u32,
    /// Section header table file offset.
    pub e_shoff: u32,
    /// Processor-specific flags.
    pub e_flags: u32,
    /// ELF header size.
    pub e_ehsize: u16,
    /// Program header entry size.
    pub e_phentsize: u16,
    /// Number of program headers.
    pub e_phnum: u16,
    /// Section header entry size.
    pub e_shentsize: u16,
    /// Number of section headers.
    pub e_shnum: u16,
    /// Section name string table index.
    pub e_shstrndx: u16,
}

/// Loadable segment.
pub const PT_LOAD: u32 = 1;

bitflags! {
    /// Program header permission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// Segment is executable
        const EXECUTE = 1 << 0;
        /// Segment is writable
        const WRITE = 1 << 1;
        /// Segment is readable
        const READ = 1 << 2;
    }
}

/// Program header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf32Phdr {
    /// Segment type.
    pub p_type: u32,
    /// File offset.
    pub p_offset: u32,
    /// Virtual address.
    pub p_vaddr: u32,
    /// Physical address.
    pub p_paddr: u32,
    /// File size.
    pub p_filesz: u32,
    /// Memory size.
    pub p_memsz: u32,
    /// Flags.
    pub p_flags: u32,
    /// Alignment.
    pub p_align: u32,
}

impl Elf32Phdr {
    /// Permission flags, unknown bits dropped.
    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_truncate(self.p_flags)
    }

    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    pub fn is_executable(&self) -> bool {
        self.flags().contains(SegmentFlags::EXECUTE)
    }
}

/// Section header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf32Shdr {
    /// Section name (string table index).
    pub sh_name: u32,
    /// Section type.
    pub sh_type: u32,
    /// Section flags.
    pub sh_flags: u32,
    /// Virtual address.
    pub sh_addr: u32,
    /// File offset.
    pub sh_offset: u32,
    /// Section size.
    pub sh_size: u32,
    /// Link to another section.
    pub sh_link: u32,
    /// Additional info.
    pub sh_info: u32,
    /// Alignment.
    pub sh_addralign: u32,
    /// Entry size if table.
    pub sh_entsize: u32,
}

// =============================================================================
// Dynamic linking structures
// =============================================================================

/// Undefined section index.
pub const SHN_UNDEF: u16 = 0;

/// Symbol table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf32Sym {
    /// Symbol name (string table index).
    pub st_name: u32,
    /// Symbol value.
    pub st_value: u32,
    /// Symbol size.
    pub st_size: u32,
    /// Symbol info (type and binding).
    pub st_info: u8,
    /// Symbol visibility.
    pub st_other: u8,
    /// Section index.
    pub st_shndx: u16,
}

impl Elf32Sym {
    pub fn is_defined(&self) -> bool {
        self.st_shndx != SHN_UNDEF
    }
}

/// Relocation entry without addend.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf32Rel {
    /// Address to relocate, relative to the executable segment.
    pub r_offset: u32,
    /// Relocation type and symbol index.
    pub r_info: u32,
}

impl Elf32Rel {
    /// Get relocation type.
    pub fn r_type(&self) -> u8 {
        (self.r_info & 0xff) as u8
    }

    /// Get symbol index.
    pub fn r_sym(&self) -> usize {
        (self.r_info >> 8) as usize
    }
}

/// ARM relocation types.
pub mod r_arm {
    pub const R_ARM_ABS32: u8 = 2;
    pub const R_ARM_GLOB_DAT: u8 = 21;
    pub const R_ARM_JUMP_SLOT: u8 = 22;
    pub const R_ARM_RELATIVE: u8 = 23;
}

/// Dynamic entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf32Dyn {
    /// Entry tag.
    pub d_tag: i32,
    /// Entry value.
    pub d_val: u32,
}

/// Dynamic tags.
pub const DT_NULL: i32 = 0;
pub const DT_SONAME: i32 = 14;

// =============================================================================
// Raw reads
// =============================================================================

/// Plain-old-data ELF records that may be read from any byte pattern.
///
/// # Safety
///
/// Implementors must be `repr(C)` and consist only of integer fields.
pub unsafe trait Record: Copy {}

unsafe impl Record for Elf32Header {}
unsafe impl Record for Elf32Phdr {}
unsafe impl Record for Elf32Shdr {}
unsafe impl Record for Elf32Sym {}
unsafe impl Record for Elf32Rel {}
unsafe impl Record for Elf32Dyn {}

/// Reads the `index`-th record of a table starting at `offset`.
pub fn read_record<T: Record>(data: &[u8], offset: usize, index: usize) -> Result<T, LoadError> {
    let size = core::mem::size_of::<T>();
    let start = index
        .checked_mul(size)
        .and_then(|rel| rel.checked_add(offset))
        .ok_or(LoadError::InvalidFormat)?;
    let end = start.checked_add(size).ok_or(LoadError::InvalidFormat)?;
    if end > data.len() {
        return Err(LoadError::InvalidFormat);
    }

    // In bounds, and `Record` guarantees every bit pattern is a valid value.
    Ok(unsafe { core::ptr::read_unaligned(data.as_ptr().add(start) as *const T) })
}

/// Reads a little-endian word.
pub fn read_u32(data: &[u8], offset: usize) -> Result<u32, LoadError> {
    let end = offset.checked_add(4).ok_or(LoadError::InvalidFormat)?;
    let bytes = data.get(offset..end).ok_or(LoadError::InvalidFormat)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Returns the NUL-terminated byte string at `offset`, without the NUL.
///
/// An unterminated string runs to the end of `data`.
pub fn read_cstr(data: &[u8], offset: usize) -> Result<&[u8], LoadError> {
    let tail = data.get(offset..).ok_or(LoadError::InvalidFormat)?;
    let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(&tail[..len])
}

/// Validates identification and returns the file header.
pub fn parse_header(data: &[u8]) -> Result<Elf32Header, LoadError> {
    if data.len() < ELF_MAGIC.len() || data[..4] != ELF_MAGIC {
        return Err(LoadError::InvalidFormat);
    }

    let header: Elf32Header = read_record(data, 0, 0)?;

    if header.e_ident[4] != ELFCLASS32 || header.e_ident[5] != ELFDATA2LSB {
        return Err(LoadError::InvalidFormat);
    }

    if header.e_type != ET_DYN {
        log::warn!("ELF type {} is not a shared object", header.e_type);
    }

    if header.e_machine != EM_ARM {
        log::warn!("ELF machine {} is not ARM", header.e_machine);
    }

    Ok(header)
}

/// Reads the program header table.
pub fn parse_program_headers(data: &[u8], header: &Elf32Header) -> Result<Vec<Elf32Phdr>, LoadError> {
    (0..header.e_phnum as usize)
        .map(|i| read_record(data, header.e_phoff as usize, i))
        .collect()
}

/// Reads the section header table.
pub fn parse_section_headers(data: &[u8], header: &Elf32Header) -> Result<Vec<Elf32Shdr>, LoadError> {
    (0..header.e_shnum as usize)
        .map(|i| read_record(data, header.e_shoff as usize, i))
        .collect()
}
