//! # Symbol resolver
//!
//! Finds a defined symbol by exact name and returns its rebased address.
//! With a `.hash` section the lookup walks one SysV bucket chain; without it
//! every entry of `.dynsym` is scanned.

use crate::error::LoadError;
use crate::host::PageAllocator;
use crate::image::{Image, ImageLayout};

/// How candidates are enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// Walk the `.hash` bucket chain for the name.
    Hashed,
    /// Scan every dynamic symbol.
    Linear,
}

/// SysV ELF hash, as produced by standard toolchains.
pub fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &byte in name {
        h = (h << 4).wrapping_add(byte as u32);
        let high = h & 0xf000_0000;
        if high != 0 {
            h ^= high >> 24;
        }
        h &= 0x0fff_ffff;
    }
    h
}

/// Symbol indices to compare, in lookup order.
enum Candidates<'b> {
    Chain {
        layout: &'b ImageLayout,
        bytes: &'b [u8],
        nbucket: usize,
        nchain: usize,
        next: usize,
        steps: usize,
    },
    Range(core::ops::Range<usize>),
}

impl Iterator for Candidates<'_> {
    type Item = Result<usize, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Candidates::Range(range) => range.next().map(Ok),
            Candidates::Chain {
                layout,
                bytes,
                nbucket,
                nchain,
                next,
                steps,
            } => {
                // Index 0 ends the chain; a chain longer than nchain is a loop.
                if *next == 0 || *next >= *nchain || *steps >= *nchain {
                    return None;
                }
                let current = *next;
                *steps += 1;

                let hash = match layout.hash {
                    Some(hash) => hash,
                    None => return None,
                };
                let addr = hash.addr + (2 + *nbucket + current) * 4;
                match layout.read_word(*bytes, addr) {
                    Ok(word) => *next = word as usize,
                    Err(err) => return Some(Err(err)),
                }
                Some(Ok(current))
            }
        }
    }
}

fn candidates<'b>(
    layout: &'b ImageLayout,
    bytes: &'b [u8],
    name: &[u8],
    strategy: LookupStrategy,
) -> Result<Candidates<'b>, LoadError> {
    let hash = match (strategy, layout.hash) {
        (LookupStrategy::Hashed, Some(hash)) => hash,
        _ => return Ok(Candidates::Range(0..layout.dynsym.count)),
    };

    if hash.count < 2 {
        return Err(LoadError::InvalidFormat);
    }
    let nbucket = layout.read_word(bytes, hash.addr)? as usize;
    let nchain = layout.read_word(bytes, hash.addr + 4)? as usize;
    let words = nbucket.checked_add(nchain).and_then(|n| n.checked_add(2));
    if nbucket == 0 || words.map_or(true, |words| words > hash.count) {
        log::error!("hash table {}+{} does not fit {} words", nbucket, nchain, hash.count);
        return Err(LoadError::InvalidFormat);
    }

    let bucket = elf_hash(name) as usize % nbucket;
    let first = layout.read_word(bytes, hash.addr + (2 + bucket) * 4)? as usize;

    Ok(Candidates::Chain {
        layout,
        bytes,
        nbucket,
        nchain: nchain.min(layout.dynsym.count),
        next: first,
        steps: 0,
    })
}

impl<A: PageAllocator + ?Sized> Image<'_, A> {
    /// Address of the symbol `name`, hashed when a `.hash` section exists.
    pub fn resolve_symbol(&self, name: &str) -> Result<usize, LoadError> {
        let strategy = if self.layout.hash.is_some() {
            LookupStrategy::Hashed
        } else {
            LookupStrategy::Linear
        };
        self.resolve_symbol_with(name, strategy)
    }

    /// Address of the symbol `name` using a specific strategy.
    ///
    /// `Hashed` falls back to a scan when the image has no hash table.
    pub fn resolve_symbol_with(&self, name: &str, strategy: LookupStrategy) -> Result<usize, LoadError> {
        let layout = &self.layout;
        let bytes = self.mapping.bytes();
        let wanted = name.as_bytes();

        for index in candidates(layout, bytes, wanted, strategy)? {
            let sym = layout.symbol(bytes, index?)?;
            if layout.symbol_name(bytes, &sym)? == wanted {
                let addr = layout.text_addr(sym.st_value);
                log::trace!("{} -> {:#x} ({:?})", name, addr, strategy);
                return Ok(addr);
            }
        }

        Err(LoadError::SymbolNotFound)
    }
}
