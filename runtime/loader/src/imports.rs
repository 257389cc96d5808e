//! # Import table and import resolution
//!
//! The host registers the functions an image may call by name. Resolution
//! then patches every undefined global-data or jump-slot relocation with the
//! first matching binding.

use alloc::string::String;
use alloc::vec::Vec;

use crate::elf::r_arm;
use crate::error::LoadError;
use crate::host::{PageAllocator, OUT_OF_MEMORY};
use crate::image::{Image, Stage};

/// Bytes one binding occupies on the 32-bit target: name pointer and address.
pub const ENTRY_SIZE: usize = 8;

/// Reservation granularity of an [`ImportTable`].
pub const PAGE_SIZE: usize = 0x1000;

/// A named host function or object offered to images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    pub name: String,
    pub address: usize,
}

/// Append-ordered name to address bindings with a fixed byte capacity.
#[derive(Debug, Clone)]
pub struct ImportTable {
    bindings: Vec<ImportBinding>,
    capacity: usize,
}

impl ImportTable {
    /// Reserves `capacity` bytes, rounded up to whole pages (at least one).
    ///
    /// Fails with [`OUT_OF_MEMORY`] when the reservation cannot be made.
    pub fn new(capacity: usize) -> Result<Self, LoadError> {
        let capacity = capacity
            .max(1)
            .checked_add(PAGE_SIZE - 1)
            .ok_or(LoadError::Host(OUT_OF_MEMORY))?
            & !(PAGE_SIZE - 1);

        let mut bindings = Vec::new();
        bindings.try_reserve_exact(capacity / ENTRY_SIZE).map_err(|_| {
            log::error!("cannot reserve an import table of {:#x} bytes", capacity);
            LoadError::Host(OUT_OF_MEMORY)
        })?;

        Ok(Self { bindings, capacity })
    }

    /// Adds a binding after every existing one.
    pub fn append(&mut self, name: &str, address: usize) -> Result<(), LoadError> {
        if (self.bindings.len() + 1) * ENTRY_SIZE > self.capacity {
            log::error!("import table full, cannot add {}", name);
            return Err(LoadError::TableFull);
        }

        self.bindings.push(ImportBinding {
            name: name.into(),
            address,
        });
        Ok(())
    }

    /// Rebinds the first binding named `name`.
    pub fn replace(&mut self, name: &str, address: usize) -> Result<(), LoadError> {
        let binding = self
            .bindings
            .iter_mut()
            .find(|binding| binding.name == name)
            .ok_or(LoadError::SymbolNotFound)?;
        binding.address = address;
        Ok(())
    }

    /// Address of the first binding named `name`.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.lookup_bytes(name.as_bytes())
    }

    fn lookup_bytes(&self, name: &[u8]) -> Option<usize> {
        self.bindings
            .iter()
            .find(|binding| binding.name.as_bytes() == name)
            .map(|binding| binding.address)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bindings in append order.
    pub fn iter(&self) -> impl Iterator<Item = &ImportBinding> {
        self.bindings.iter()
    }
}

/// What resolution does with a name the table lacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingImportPolicy {
    /// Write the relocation's own offset into the slot so a call through it
    /// faults at a recognizable address.
    #[default]
    Taint,
    /// Abort with [`LoadError::SymbolNotFound`].
    Fail,
}

/// Outcome of an import resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Slots bound from the table.
    pub resolved: usize,
    /// Names the table did not provide, in relocation order.
    pub missing: Vec<String>,
}

impl<A: PageAllocator + ?Sized> Image<'_, A> {
    /// Binds undefined symbols using the policy chosen at load time.
    pub fn resolve_imports(&mut self, table: &ImportTable) -> Result<ImportReport, LoadError> {
        let policy = self.missing_imports;
        self.resolve_imports_with(table, policy)
    }

    /// Binds every undefined global-data and jump-slot relocation from `table`.
    pub fn resolve_imports_with(
        &mut self,
        table: &ImportTable,
        policy: MissingImportPolicy,
    ) -> Result<ImportReport, LoadError> {
        self.expect_stage(Stage::Relocated)?;

        let layout = self.layout;
        let mut view = self.mapping.writable()?;
        let mut report = ImportReport::default();

        for i in 0..layout.relocation_count() {
            let rel = layout.relocation(view.bytes(), i)?;
            if !matches!(rel.r_type(), r_arm::R_ARM_GLOB_DAT | r_arm::R_ARM_JUMP_SLOT) {
                continue;
            }

            let sym = layout.symbol(view.bytes(), rel.r_sym())?;
            if sym.is_defined() {
                continue;
            }

            let target = layout.text_addr(rel.r_offset);
            let name = layout.symbol_name(view.bytes(), &sym)?;
            let value = match table.lookup_bytes(name) {
                Some(address) => {
                    let address = u32::try_from(address).map_err(|_| {
                        log::error!("import {:#x} does not fit a 32-bit slot", address);
                        LoadError::InvalidArgument
                    })?;
                    report.resolved += 1;
                    address
                }
                None => {
                    let name = String::from_utf8_lossy(name).into_owned();
                    if policy == MissingImportPolicy::Fail {
                        log::error!("missing import {}", name);
                        return Err(LoadError::SymbolNotFound);
                    }
                    log::warn!("missing import {}, slot {:#x} tainted", name, target);
                    report.missing.push(name);
                    rel.r_offset
                }
            };

            layout.write_word(view.bytes_mut(), target, value)?;
        }

        drop(view);
        self.stage = Stage::ImportsResolved;
        log::info!(
            "imports resolved: {} bound, {} missing",
            report.resolved,
            report.missing.len()
        );
        Ok(report)
    }
}
