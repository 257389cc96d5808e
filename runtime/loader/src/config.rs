//! Loader configuration.

use crate::imports::MissingImportPolicy;

/// Tunables for [`Image::load_with`](crate::Image::load_with) and import
/// resolution.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Granularity of the persistent image region.
    pub region_alignment: usize,
    /// Granularity of the staging copy of the file.
    pub staging_page: usize,
    /// Allocation name of the staging region.
    pub staging_name: &'static str,
    /// Allocation name of the persistent region.
    pub image_name: &'static str,
    /// What import resolution does with names the table lacks.
    pub missing_imports: MissingImportPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            region_alignment: 1024 * 1024, // 1 MiB
            staging_page: 0x1000,          // 4 KiB
            staging_name: "SoLoader::FileMem",
            image_name: "SoLoader::RwxBlock",
            missing_imports: MissingImportPolicy::Taint,
        }
    }
}

/// Rounds `value` up to a multiple of the power-of-two `align`.
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    (value + (align - 1)) & !(align - 1)
}
