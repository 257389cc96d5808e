//! # Function hooks
//!
//! A hook overwrites the first instructions of a function with an absolute
//! branch to a replacement. Thumb (compact) functions get
//! `ldr.w pc, [pc]`, padded by one `nop` when the entry is not word aligned;
//! ARM (wide) functions get `ldr pc, [pc, #-4]`. The branch target follows as
//! a literal word.
//!
//! Patched code is not visible to instruction fetch until
//! [`Image::flush_instruction_cache`] runs.

use crate::error::LoadError;
use crate::host::{PageAllocator, Protection};
use crate::image::{Image, Stage};

/// Thumb `nop`.
const THUMB_NOP: u16 = 0xbf00;
/// Thumb-2 `ldr.w pc, [pc]`, halfwords swapped for a little-endian word.
const THUMB_LDR_PC: u32 = 0xf000_f8df;
/// ARM `ldr pc, [pc, #-4]`.
const ARM_LDR_PC: u32 = 0xe51f_f004;

/// Branch target as the 32-bit literal the patch loads into `pc`.
fn branch_literal(replacement: usize) -> Result<u32, LoadError> {
    u32::try_from(replacement).map_err(|_| {
        log::error!("hook target {:#x} does not fit a 32-bit literal", replacement);
        LoadError::InvalidArgument
    })
}

impl<A: PageAllocator + ?Sized> Image<'_, A> {
    /// Redirects the Thumb function at `address` to `replacement`.
    ///
    /// The Thumb bit of `address` is ignored.
    pub fn hook_compact(&mut self, address: usize, replacement: usize) -> Result<(), LoadError> {
        if address == 0 || replacement == 0 {
            return Err(LoadError::InvalidArgument);
        }

        let literal = branch_literal(replacement)?;

        let mut start = address & !1;
        let padded = start & 2 != 0;
        let len = if padded { 10 } else { 8 };
        self.check_patch(start, len)?;

        let layout = self.layout;
        let mut view = self.mapping.writable()?;
        let bytes = view.bytes_mut();
        if padded {
            let offset = layout.offset(start, 2)?;
            bytes[offset..offset + 2].copy_from_slice(&THUMB_NOP.to_le_bytes());
            start += 2;
        }
        layout.write_word(bytes, start, THUMB_LDR_PC)?;
        layout.write_word(bytes, start + 4, literal)?;

        log::debug!("thumb hook {:#x} -> {:#x}", address, replacement);
        Ok(())
    }

    /// Redirects the ARM function at `address` to `replacement`.
    pub fn hook_wide(&mut self, address: usize, replacement: usize) -> Result<(), LoadError> {
        if address == 0 || replacement == 0 {
            return Err(LoadError::InvalidArgument);
        }
        let literal = branch_literal(replacement)?;
        self.check_patch(address, 8)?;

        let layout = self.layout;
        let mut view = self.mapping.writable()?;
        layout.write_word(view.bytes_mut(), address, ARM_LDR_PC)?;
        layout.write_word(view.bytes_mut(), address + 4, literal)?;

        log::debug!("arm hook {:#x} -> {:#x}", address, replacement);
        Ok(())
    }

    /// [`hook_compact`](Self::hook_compact) on a symbol of this image.
    pub fn hook_compact_symbol(&mut self, name: &str, replacement: usize) -> Result<(), LoadError> {
        let address = self.resolve_symbol(name)?;
        self.hook_compact(address, replacement)
    }

    /// [`hook_wide`](Self::hook_wide) on a symbol of this image.
    pub fn hook_wide_symbol(&mut self, name: &str, replacement: usize) -> Result<(), LoadError> {
        let address = self.resolve_symbol(name)?;
        self.hook_wide(address, replacement)
    }

    /// Makes code written since load visible to instruction fetch.
    pub fn flush_instruction_cache(&self) -> Result<(), LoadError> {
        let text = self.layout.text;
        self.mapping
            .host()
            .sync_instruction_cache(self.mapping.region(), text.base, text.size)?;
        log::trace!("icache synced {:#x}+{:#x}", text.base, text.size);
        Ok(())
    }

    fn check_patch(&self, start: usize, len: usize) -> Result<(), LoadError> {
        if !matches!(self.stage, Stage::Relocated | Stage::ImportsResolved) {
            log::error!("cannot hook an image at stage {:?}", self.stage);
            return Err(LoadError::InvalidArgument);
        }

        let protection = self.mapping.region().protection;
        if !protection.contains(Protection::WRITE | Protection::EXECUTE) {
            log::error!("image region is {:?}, cannot patch code", protection);
            return Err(LoadError::InvalidArgument);
        }

        let text = self.layout.text;
        let inside = start >= text.base
            && start
                .checked_add(len)
                .map_or(false, |end| end <= text.base + text.size);
        if !inside {
            log::error!("patch {:#x}+{} outside text segment", start, len);
            return Err(LoadError::InvalidArgument);
        }
        Ok(())
    }
}
