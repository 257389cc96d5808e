//! Load-time relocation of ARM `REL` entries.

use crate::elf::r_arm;
use crate::error::LoadError;
use crate::host::PageAllocator;
use crate::image::{Image, Stage};

impl<A: PageAllocator + ?Sized> Image<'_, A> {
    /// Applies `.rel.dyn` then `.rel.plt` against the image's own symbols.
    ///
    /// Global-data and jump-slot entries naming an undefined symbol are left
    /// for [`Image::resolve_imports`].
    pub fn relocate(&mut self) -> Result<(), LoadError> {
        self.expect_stage(Stage::Loaded)?;

        let layout = self.layout;
        let text_base = layout.text.base as u32;
        let mut view = self.mapping.writable()?;
        let mut deferred = 0usize;

        for i in 0..layout.relocation_count() {
            let rel = layout.relocation(view.bytes(), i)?;
            let kind = rel.r_type();
            let target = layout.text_addr(rel.r_offset);

            let value = match kind {
                r_arm::R_ARM_ABS32 => {
                    let sym = layout.symbol(view.bytes(), rel.r_sym())?;
                    let current = layout.read_word(view.bytes(), target)?;
                    current.wrapping_add(text_base.wrapping_add(sym.st_value))
                }
                r_arm::R_ARM_RELATIVE => {
                    let current = layout.read_word(view.bytes(), target)?;
                    current.wrapping_add(text_base)
                }
                r_arm::R_ARM_GLOB_DAT | r_arm::R_ARM_JUMP_SLOT => {
                    let sym = layout.symbol(view.bytes(), rel.r_sym())?;
                    if !sym.is_defined() {
                        deferred += 1;
                        continue;
                    }
                    text_base.wrapping_add(sym.st_value)
                }
                _ => {
                    log::error!("unsupported relocation type {} at {:#x}", kind, rel.r_offset);
                    return Err(LoadError::UnsupportedRelocationKind(kind));
                }
            };

            log::trace!("reloc type {} at {:#x} -> {:#x}", kind, target, value);
            layout.write_word(view.bytes_mut(), target, value)?;
        }

        drop(view);
        self.stage = Stage::Relocated;
        log::info!(
            "relocated {} entries ({} deferred to imports)",
            layout.relocation_count(),
            deferred
        );
        Ok(())
    }
}
