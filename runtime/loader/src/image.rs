//! # Image parser, segment loader and section locator
//!
//! [`Image::load`] stages the file in host memory, copies every `PT_LOAD`
//! segment into one persistent read/write/execute region, then finds the
//! dynamic-linking sections by name. Everything the later stages need is
//! recorded as an address inside that region.
//!
//! Addresses follow the executable segment: `text_base` is the region base
//! plus the executable segment's declared address, and every other segment,
//! section and relocation offset is expressed relative to `text_base`.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{align_up, LoaderConfig};
use crate::elf::{
    self, read_cstr, read_record, Elf32Dyn, Elf32Header, Elf32Phdr, Elf32Rel, Elf32Shdr, Elf32Sym,
    DT_NULL, DT_SONAME,
};
use crate::error::LoadError;
use crate::host::{Mapping, PageAllocator, Protection, Region};
use crate::imports::MissingImportPolicy;

/// A loaded segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Rebased start address.
    pub base: usize,
    /// Size in memory.
    pub size: usize,
}

/// Pipeline position of an [`Image`].
///
/// Stages run once each, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Segments copied and sections located.
    Loaded,
    /// Load-time relocations applied.
    Relocated,
    /// Undefined symbols bound from an import table.
    ImportsResolved,
    /// Initializers have run; the image is immutable.
    Initialized,
}

/// A table inside the image: start address and element count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Table {
    pub addr: usize,
    pub count: usize,
}

impl Table {
    fn new(addr: usize, size: usize, entry_size: usize) -> Self {
        Self {
            addr,
            count: size / entry_size,
        }
    }
}

// =============================================================================
// Layout
// =============================================================================

/// Where everything lives inside the persistent region.
///
/// Readers take the region bytes explicitly so the same code serves both a
/// shared borrow of the image and an open writable view.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageLayout {
    pub region: Region,
    pub text: Segment,
    pub dynamic: Table,
    /// `count` is the size in bytes.
    pub dynstr: Table,
    pub dynsym: Table,
    pub rel_dyn: Table,
    pub rel_plt: Table,
    pub init_array: Option<Table>,
    /// `count` is the size in 32-bit words.
    pub hash: Option<Table>,
}

impl ImageLayout {
    /// Region offset of `[addr, addr + len)`.
    pub fn offset(&self, addr: usize, len: usize) -> Result<usize, LoadError> {
        if self.region.contains(addr, len) {
            Ok(addr - self.region.base)
        } else {
            Err(LoadError::InvalidFormat)
        }
    }

    /// Address of `offset` bytes past the executable segment base.
    pub fn text_addr(&self, offset: u32) -> usize {
        self.text.base.wrapping_add(offset as usize)
    }

    pub fn read_word(&self, bytes: &[u8], addr: usize) -> Result<u32, LoadError> {
        elf::read_u32(bytes, self.offset(addr, 4)?)
    }

    pub fn write_word(&self, bytes: &mut [u8], addr: usize, value: u32) -> Result<(), LoadError> {
        let offset = self.offset(addr, 4)?;
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn symbol(&self, bytes: &[u8], index: usize) -> Result<Elf32Sym, LoadError> {
        if index >= self.dynsym.count {
            return Err(LoadError::InvalidFormat);
        }
        read_record(bytes, self.offset(self.dynsym.addr, 0)?, index)
    }

    pub fn symbol_name<'b>(&self, bytes: &'b [u8], sym: &Elf32Sym) -> Result<&'b [u8], LoadError> {
        let start = self.offset(self.dynstr.addr, self.dynstr.count)?;
        read_cstr(&bytes[start..start + self.dynstr.count], sym.st_name as usize)
    }

    /// `.rel.dyn` followed by `.rel.plt`.
    pub fn relocation_count(&self) -> usize {
        self.rel_dyn.count + self.rel_plt.count
    }

    pub fn relocation(&self, bytes: &[u8], index: usize) -> Result<Elf32Rel, LoadError> {
        let (table, index) = if index < self.rel_dyn.count {
            (self.rel_dyn, index)
        } else {
            (self.rel_plt, index - self.rel_dyn.count)
        };
        if index >= table.count {
            return Err(LoadError::InvalidFormat);
        }
        read_record(bytes, self.offset(table.addr, 0)?, index)
    }

    pub fn dynamic_entry(&self, bytes: &[u8], index: usize) -> Result<Elf32Dyn, LoadError> {
        read_record(bytes, self.offset(self.dynamic.addr, 0)?, index)
    }
}

// =============================================================================
// Image
// =============================================================================

/// One loaded shared object.
///
/// The persistent region is released when the image is dropped, so the image
/// must outlive every call into its code.
pub struct Image<'a, A: PageAllocator + ?Sized> {
    pub(crate) mapping: Mapping<'a, A>,
    pub(crate) layout: ImageLayout,
    header: Elf32Header,
    program_headers: Vec<Elf32Phdr>,
    section_headers: Vec<Elf32Shdr>,
    data: Option<Segment>,
    soname: Option<String>,
    pub(crate) stage: Stage,
    pub(crate) missing_imports: MissingImportPolicy,
}

impl<'a, A: PageAllocator + ?Sized> Image<'a, A> {
    /// Loads an image with the default configuration.
    pub fn load(host: &'a A, buffer: &[u8]) -> Result<Self, LoadError> {
        Self::load_with(host, buffer, &LoaderConfig::default())
    }

    /// Loads an image from a complete in-memory ELF file.
    ///
    /// On failure every region acquired so far has been released.
    pub fn load_with(host: &'a A, buffer: &[u8], config: &LoaderConfig) -> Result<Self, LoadError> {
        if buffer.is_empty() {
            return Err(LoadError::InvalidArgument);
        }

        // Stage the file
        let mut staging = Mapping::allocate(
            host,
            config.staging_name,
            align_up(buffer.len(), config.staging_page),
            Protection::READ_WRITE,
        )?;
        {
            let mut view = staging.writable()?;
            view.bytes_mut()[..buffer.len()].copy_from_slice(buffer);
        }
        let file = &staging.bytes()[..buffer.len()];

        // Parse headers
        let header = elf::parse_header(file)?;
        let program_headers = elf::parse_program_headers(file, &header)?;
        let section_headers = elf::parse_section_headers(file, &header)?;

        // Map segments
        let mut mapping = Mapping::allocate(
            host,
            config.image_name,
            align_up(buffer.len(), config.region_alignment),
            Protection::READ_WRITE_EXECUTE,
        )?;
        let (text, data) = load_segments(&mut mapping, file, &program_headers)?;

        // Find dynamic-linking metadata
        let layout = locate_sections(*mapping.region(), text, file, &header, &section_headers)?;
        let soname = read_soname(&layout, mapping.bytes())?;

        log::info!(
            "loaded {} at {:#x} (text {:#x} bytes, data {:?})",
            soname.as_deref().unwrap_or("<unnamed>"),
            text.base,
            text.size,
            data
        );

        Ok(Self {
            mapping,
            layout,
            header,
            program_headers,
            section_headers,
            data,
            soname,
            stage: Stage::Loaded,
            missing_imports: config.missing_imports,
        })
    }

    /// Base address of the executable segment.
    pub fn text_base(&self) -> usize {
        self.layout.text.base
    }

    /// Memory size of the executable segment.
    pub fn text_size(&self) -> usize {
        self.layout.text.size
    }

    /// Base address of the last non-executable segment, if any.
    pub fn data_base(&self) -> Option<usize> {
        self.data.map(|segment| segment.base)
    }

    pub fn data_size(&self) -> Option<usize> {
        self.data.map(|segment| segment.size)
    }

    /// Name declared by `DT_SONAME`.
    pub fn soname(&self) -> Option<&str> {
        self.soname.as_deref()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The persistent region holding all segments.
    pub fn region(&self) -> &Region {
        self.mapping.region()
    }

    pub fn header(&self) -> &Elf32Header {
        &self.header
    }

    /// Program headers as declared in the file.
    pub fn program_headers(&self) -> &[Elf32Phdr] {
        &self.program_headers
    }

    /// Section headers as declared in the file.
    pub fn section_headers(&self) -> &[Elf32Shdr] {
        &self.section_headers
    }

    /// Number of entries in the dynamic symbol table.
    pub fn symbol_count(&self) -> usize {
        self.layout.dynsym.count
    }

    /// Fails unless the image is exactly at `stage`.
    pub(crate) fn expect_stage(&self, stage: Stage) -> Result<(), LoadError> {
        if self.stage != stage {
            log::error!("{:?} expected, image is {:?}", stage, self.stage);
            return Err(LoadError::InvalidArgument);
        }
        Ok(())
    }
}

/// Copies every loadable segment into the persistent region.
fn load_segments<A: PageAllocator + ?Sized>(
    mapping: &mut Mapping<'_, A>,
    file: &[u8],
    phdrs: &[Elf32Phdr],
) -> Result<(Segment, Option<Segment>), LoadError> {
    let region = *mapping.region();
    let mut view = mapping.writable()?;

    let mut text: Option<Segment> = None;
    let mut data: Option<Segment> = None;
    let mut data_candidate = 0usize;

    for phdr in phdrs.iter().filter(|phdr| phdr.is_load()) {
        let memsz = phdr.p_memsz as usize;
        let filesz = phdr.p_filesz as usize;

        let dest = if phdr.is_executable() {
            if text.is_some() {
                log::error!("second executable segment at {:#x}", phdr.p_vaddr);
                return Err(LoadError::InvalidFormat);
            }

            let base = region.base.wrapping_add(phdr.p_vaddr as usize);
            text = Some(Segment { base, size: memsz });
            data_candidate = region.base + align_up(memsz, phdr.p_align as usize);
            base
        } else {
            let text = text.ok_or(LoadError::MissingExecutableSegment)?;

            let base = text.base.wrapping_add(phdr.p_vaddr as usize);
            if base < data_candidate {
                log::warn!("data segment {:#x} overlaps text (free from {:#x})", base, data_candidate);
            }
            data = Some(Segment { base, size: memsz });
            base
        };

        if !region.contains(dest, memsz.max(filesz)) {
            log::error!("segment {:#x}+{:#x} outside image region", dest, memsz);
            return Err(LoadError::InvalidFormat);
        }

        let src_start = phdr.p_offset as usize;
        let src = src_start
            .checked_add(filesz)
            .and_then(|src_end| file.get(src_start..src_end))
            .ok_or(LoadError::InvalidFormat)?;

        // The memsz - filesz tail is already zero.
        let offset = dest - region.base;
        view.bytes_mut()[offset..offset + filesz].copy_from_slice(src);

        log::debug!(
            "segment {:?} vaddr {:#x} -> {:#x} ({} of {} bytes)",
            phdr.flags(),
            phdr.p_vaddr,
            dest,
            filesz,
            memsz
        );
    }

    let text = text.ok_or(LoadError::MissingExecutableSegment)?;
    Ok((text, data))
}

/// Finds the dynamic-linking sections by name.
fn locate_sections(
    region: Region,
    text: Segment,
    file: &[u8],
    header: &Elf32Header,
    shdrs: &[Elf32Shdr],
) -> Result<ImageLayout, LoadError> {
    let shstr = shdrs
        .get(header.e_shstrndx as usize)
        .ok_or(LoadError::InvalidFormat)?;
    let shstr_offset = shstr.sh_offset as usize;

    let mut dynamic = None;
    let mut dynstr = None;
    let mut dynsym = None;
    let mut rel_dyn = None;
    let mut rel_plt = None;
    let mut init_array = None;
    let mut hash = None;

    for shdr in shdrs {
        let name = read_cstr(file, shstr_offset.wrapping_add(shdr.sh_name as usize))?;
        let addr = text.base.wrapping_add(shdr.sh_addr as usize);
        let size = shdr.sh_size as usize;

        let slot = match name {
            b".dynamic" => (&mut dynamic, core::mem::size_of::<Elf32Dyn>()),
            b".dynstr" => (&mut dynstr, 1),
            b".dynsym" => (&mut dynsym, core::mem::size_of::<Elf32Sym>()),
            b".rel.dyn" => (&mut rel_dyn, core::mem::size_of::<Elf32Rel>()),
            b".rel.plt" => (&mut rel_plt, core::mem::size_of::<Elf32Rel>()),
            b".init_array" => (&mut init_array, 4),
            b".hash" => (&mut hash, 4),
            _ => continue,
        };

        if !region.contains(addr, size) {
            log::error!(
                "section {} at {:#x}+{:#x} outside image region",
                String::from_utf8_lossy(name),
                addr,
                size
            );
            return Err(LoadError::InvalidFormat);
        }

        log::debug!("section {} at {:#x} ({} bytes)", String::from_utf8_lossy(name), addr, size);
        *slot.0 = Some(Table::new(addr, size, slot.1));
    }

    match (dynamic, dynstr, dynsym, rel_dyn, rel_plt) {
        (Some(dynamic), Some(dynstr), Some(dynsym), Some(rel_dyn), Some(rel_plt)) => Ok(ImageLayout {
            region,
            text,
            dynamic,
            dynstr,
            dynsym,
            rel_dyn,
            rel_plt,
            init_array,
            hash,
        }),
        _ => {
            log::error!(
                "incomplete dynamic info: dynamic={} dynstr={} dynsym={} rel.dyn={} rel.plt={}",
                dynamic.is_some(),
                dynstr.is_some(),
                dynsym.is_some(),
                rel_dyn.is_some(),
                rel_plt.is_some()
            );
            Err(LoadError::IncompleteDynamicInfo)
        }
    }
}

/// Extracts `DT_SONAME` from the dynamic table.
fn read_soname(layout: &ImageLayout, bytes: &[u8]) -> Result<Option<String>, LoadError> {
    let mut soname = None;

    for i in 0..layout.dynamic.count {
        let entry = layout.dynamic_entry(bytes, i)?;
        match entry.d_tag {
            DT_NULL => break,
            DT_SONAME => {
                let start = layout.offset(layout.dynstr.addr, layout.dynstr.count)?;
                let strtab = &bytes[start..start + layout.dynstr.count];
                let name = read_cstr(strtab, entry.d_val as usize)?;
                soname = Some(String::from_utf8_lossy(name).into_owned());
            }
            _ => {}
        }
    }

    Ok(soname)
}
