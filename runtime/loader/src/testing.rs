//! Synthetic ARM shared objects for tests.
//!
//! Layout of a built file (offsets are file offsets and virtual addresses
//! alike inside the text segment):
//!
//! ```text
//! 0x0000  ELF header, program headers
//! 0x0100  code area                 (.text)
//! 0x0200  .dynsym
//! 0x0400  .dynstr
//! 0x0600  .hash
//! 0x0800  .rel.dyn
//! 0x0900  .rel.plt
//! 0x1000  data segment, vaddr 0x2000:
//!           0x2000 .dynamic
//!           0x2040 .init_array
//!           0x2080 .got / free words
//! 0x1100  .shstrtab
//! 0x1200  section headers
//! ```

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::elf::{r_arm, Elf32Dyn, Elf32Rel, Elf32Sym, DT_SONAME, EM_ARM, ET_DYN, PT_LOAD};
use crate::symbol::elf_hash;

pub const TEXT_SIZE: usize = 0x1000;
pub const CODE_OFFSET: u32 = 0x100;
pub const CODE_SIZE: usize = 0x100;
pub const DATA_VADDR: u32 = 0x2000;
pub const GOT_VADDR: u32 = 0x2080;

const DATA_OFFSET: usize = 0x1000;
const DATA_FILESZ: usize = 0x100;
const DATA_MEMSZ: usize = 0x200;

const DYNSYM_VADDR: u32 = 0x200;
const DYNSTR_VADDR: u32 = 0x400;
pub const HASH_VADDR: u32 = 0x600;
const REL_DYN_VADDR: u32 = 0x800;
const REL_PLT_VADDR: u32 = 0x900;
const DYNAMIC_VADDR: u32 = 0x2000;
const INIT_ARRAY_VADDR: u32 = 0x2040;

const SHSTRTAB_OFFSET: usize = 0x1100;
const SHDR_OFFSET: usize = 0x1200;

/// Bucket count of generated hash tables; small so chains form.
const NBUCKET: u32 = 3;

struct SymbolSpec {
    name: String,
    value: u32,
    defined: bool,
}

struct RelocSpec {
    plt: bool,
    kind: u8,
    offset: u32,
    symbol: Option<String>,
}

/// Builder for minimal ARM `ET_DYN` images.
pub struct ElfBuilder {
    soname: Option<String>,
    symbols: Vec<SymbolSpec>,
    relocs: Vec<RelocSpec>,
    words: Vec<(u32, u32)>,
    init: Vec<u32>,
    text_bytes: Vec<u8>,
    data_bytes: Vec<u8>,
    omitted: Vec<&'static str>,
    data_first: bool,
    text_flags: u32,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            soname: None,
            symbols: Vec::new(),
            relocs: Vec::new(),
            words: Vec::new(),
            init: Vec::new(),
            text_bytes: Vec::new(),
            data_bytes: Vec::new(),
            omitted: Vec::new(),
            data_first: false,
            text_flags: 0x5, // R + X
        }
    }

    pub fn soname(mut self, name: &str) -> Self {
        self.soname = Some(name.into());
        self
    }

    /// Symbol defined at `value`, relative to the text base.
    pub fn defined(mut self, name: &str, value: u32) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.into(),
            value,
            defined: true,
        });
        self
    }

    /// Symbol the image expects from outside.
    pub fn undefined(mut self, name: &str) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.into(),
            value: 0,
            defined: false,
        });
        self
    }

    /// `.rel.dyn` entry.
    pub fn rel(mut self, kind: u8, offset: u32, symbol: Option<&str>) -> Self {
        self.relocs.push(RelocSpec {
            plt: false,
            kind,
            offset,
            symbol: symbol.map(String::from),
        });
        self
    }

    /// `.rel.plt` entry.
    pub fn plt(mut self, offset: u32, symbol: &str) -> Self {
        self.relocs.push(RelocSpec {
            plt: true,
            kind: r_arm::R_ARM_JUMP_SLOT,
            offset,
            symbol: Some(symbol.into()),
        });
        self
    }

    /// Initial content of the word at `vaddr`.
    pub fn word(mut self, vaddr: u32, value: u32) -> Self {
        self.words.push((vaddr, value));
        self
    }

    /// Appends an `.init_array` slot.
    pub fn init(mut self, value: u32) -> Self {
        self.init.push(value);
        self
    }

    /// Bytes at the start of the code area.
    pub fn text_bytes(mut self, bytes: &[u8]) -> Self {
        self.text_bytes = bytes.to_vec();
        self
    }

    /// Bytes at [`GOT_VADDR`].
    pub fn data_bytes(mut self, bytes: &[u8]) -> Self {
        self.data_bytes = bytes.to_vec();
        self
    }

    pub fn omit_section(mut self, name: &'static str) -> Self {
        self.omitted.push(name);
        self
    }

    /// Lists the data segment before the text segment.
    pub fn data_first(mut self) -> Self {
        self.data_first = true;
        self
    }

    pub fn without_text_flag(mut self) -> Self {
        self.text_flags = 0x4;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut file = vec![0u8; SHDR_OFFSET];

        // Symbols and strings
        let mut dynstr = vec![0u8];
        let soname_offset = self.soname.as_ref().map(|name| push_str(&mut dynstr, name));

        let mut syms = vec![Elf32Sym::default()];
        let mut names = vec![String::new()];
        for spec in &self.symbols {
            let st_name = push_str(&mut dynstr, &spec.name);
            syms.push(Elf32Sym {
                st_name,
                st_value: spec.value,
                st_size: 4,
                st_info: 0x12, // GLOBAL FUNC
                st_other: 0,
                st_shndx: if spec.defined { 7 } else { 0 },
            });
            names.push(spec.name.clone());
        }
        for (i, sym) in syms.iter().enumerate() {
            put_record(&mut file, DYNSYM_VADDR as usize, i, sym);
        }
        file[DYNSTR_VADDR as usize..DYNSTR_VADDR as usize + dynstr.len()].copy_from_slice(&dynstr);

        // SysV hash over every symbol
        let nchain = syms.len() as u32;
        let mut buckets = vec![0u32; NBUCKET as usize];
        let mut chains = vec![0u32; syms.len()];
        for i in 1..syms.len() {
            let bucket = (elf_hash(names[i].as_bytes()) % NBUCKET) as usize;
            chains[i] = buckets[bucket];
            buckets[bucket] = i as u32;
        }
        let mut hash = vec![NBUCKET, nchain];
        hash.extend(&buckets);
        hash.extend(&chains);
        for (i, word) in hash.iter().enumerate() {
            put_u32(&mut file, HASH_VADDR as usize + i * 4, *word);
        }

        // Relocations
        let symbol_index = |name: &Option<String>| match name {
            Some(name) => names
                .iter()
                .position(|candidate| candidate == name)
                .expect("relocation names an unknown symbol") as u32,
            None => 0,
        };
        let mut rel_dyn = Vec::new();
        let mut rel_plt = Vec::new();
        for spec in &self.relocs {
            let rel = Elf32Rel {
                r_offset: spec.offset,
                r_info: (symbol_index(&spec.symbol) << 8) | spec.kind as u32,
            };
            if spec.plt {
                rel_plt.push(rel);
            } else {
                rel_dyn.push(rel);
            }
        }
        for (i, rel) in rel_dyn.iter().enumerate() {
            put_record(&mut file, REL_DYN_VADDR as usize, i, rel);
        }
        for (i, rel) in rel_plt.iter().enumerate() {
            put_record(&mut file, REL_PLT_VADDR as usize, i, rel);
        }

        // Code
        let code = CODE_OFFSET as usize;
        file[code..code + self.text_bytes.len()].copy_from_slice(&self.text_bytes);

        // Data segment contents
        let mut dynamic = Vec::new();
        if let Some(offset) = soname_offset {
            dynamic.push(Elf32Dyn {
                d_tag: DT_SONAME,
                d_val: offset,
            });
        }
        dynamic.push(Elf32Dyn::default());
        for (i, entry) in dynamic.iter().enumerate() {
            put_record(&mut file, data_file_offset(DYNAMIC_VADDR), i, entry);
        }
        for (i, value) in self.init.iter().enumerate() {
            put_u32(&mut file, data_file_offset(INIT_ARRAY_VADDR) + i * 4, *value);
        }
        let got = data_file_offset(GOT_VADDR);
        file[got..got + self.data_bytes.len()].copy_from_slice(&self.data_bytes);

        for (vaddr, value) in &self.words {
            let offset = if *vaddr >= DATA_VADDR {
                data_file_offset(*vaddr)
            } else {
                *vaddr as usize
            };
            put_u32(&mut file, offset, *value);
        }

        // Sections
        let mut shstrtab = vec![0u8];
        let mut shdrs = vec![[0u32; 10]];
        let mut section = |name: &'static str, addr: u32, offset: usize, size: usize| {
            if self.omitted.contains(&name) {
                return;
            }
            let sh_name = push_str(&mut shstrtab, name);
            shdrs.push([sh_name, 1, 0, addr, offset as u32, size as u32, 0, 0, 4, 0]);
        };
        section(".shstrtab", 0, SHSTRTAB_OFFSET, 0x100);
        section(".text", CODE_OFFSET, CODE_OFFSET as usize, CODE_SIZE);
        section(".dynsym", DYNSYM_VADDR, DYNSYM_VADDR as usize, syms.len() * 16);
        section(".dynstr", DYNSTR_VADDR, DYNSTR_VADDR as usize, dynstr.len());
        section(".hash", HASH_VADDR, HASH_VADDR as usize, hash.len() * 4);
        section(".rel.dyn", REL_DYN_VADDR, REL_DYN_VADDR as usize, rel_dyn.len() * 8);
        section(".rel.plt", REL_PLT_VADDR, REL_PLT_VADDR as usize, rel_plt.len() * 8);
        section(".dynamic", DYNAMIC_VADDR, data_file_offset(DYNAMIC_VADDR), dynamic.len() * 8);
        section(".init_array", INIT_ARRAY_VADDR, data_file_offset(INIT_ARRAY_VADDR), self.init.len() * 4);
        section(".got", GOT_VADDR, got, 0x80);

        file[SHSTRTAB_OFFSET..SHSTRTAB_OFFSET + shstrtab.len()].copy_from_slice(&shstrtab);
        for shdr in &shdrs {
            for word in shdr {
                file.extend_from_slice(&word.to_le_bytes());
            }
        }

        // Program headers
        let text_phdr = [PT_LOAD, 0, 0, 0, TEXT_SIZE as u32, TEXT_SIZE as u32, self.text_flags, 0x1000];
        let data_phdr = [
            PT_LOAD,
            DATA_OFFSET as u32,
            DATA_VADDR,
            DATA_VADDR,
            DATA_FILESZ as u32,
            DATA_MEMSZ as u32,
            0x6, // R + W
            0x1000,
        ];
        let phdrs = if self.data_first {
            [data_phdr, text_phdr]
        } else {
            [text_phdr, data_phdr]
        };
        for (i, phdr) in phdrs.iter().enumerate() {
            for (j, word) in phdr.iter().enumerate() {
                put_u32(&mut file, 0x34 + i * 32 + j * 4, *word);
            }
        }

        // File header
        file[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        file[4] = 1; // ELFCLASS32
        file[5] = 1; // ELFDATA2LSB
        file[6] = 1; // EV_CURRENT
        put_u16(&mut file, 16, ET_DYN);
        put_u16(&mut file, 18, EM_ARM);
        put_u32(&mut file, 20, 1);
        put_u32(&mut file, 28, 0x34); // e_phoff
        put_u32(&mut file, 32, SHDR_OFFSET as u32);
        put_u16(&mut file, 40, 52);
        put_u16(&mut file, 42, 32);
        put_u16(&mut file, 44, 2);
        put_u16(&mut file, 46, 40);
        put_u16(&mut file, 48, shdrs.len() as u16);
        put_u16(&mut file, 50, 1); // .shstrtab

        file
    }
}

fn data_file_offset(vaddr: u32) -> usize {
    DATA_OFFSET + (vaddr - DATA_VADDR) as usize
}

fn push_str(table: &mut Vec<u8>, s: &str) -> u32 {
    let offset = table.len() as u32;
    table.extend_from_slice(s.as_bytes());
    table.push(0);
    offset
}

fn put_u16(file: &mut [u8], offset: usize, value: u16) {
    file[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(file: &mut [u8], offset: usize, value: u32) {
    file[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_record<T: Copy>(file: &mut [u8], base: usize, index: usize, record: &T) {
    let size = core::mem::size_of::<T>();
    let start = base + index * size;
    let bytes = unsafe { core::slice::from_raw_parts(record as *const T as *const u8, size) };
    file[start..start + size].copy_from_slice(bytes);
}
