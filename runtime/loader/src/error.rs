//! Loader error taxonomy.
//!
//! Every stage returns one of these directly. Codes are small negative
//! integers so hosts that speak result codes can pass them through unchanged.

use core::fmt;

/// Opaque failure reported by the host page allocator.
///
/// The code is whatever the host returned and is never reinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostError(pub i32);

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host allocator error {:#x}", self.0)
    }
}

/// Errors produced while loading, linking or patching an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// A null address, an empty buffer, or a stage run out of order.
    InvalidArgument,
    /// The buffer is not an ELF image, or a header table points outside it.
    InvalidFormat,
    /// A loadable segment appeared before the executable one, or none exists.
    MissingExecutableSegment,
    /// One of the mandatory dynamic-linking sections is absent.
    IncompleteDynamicInfo,
    /// A relocation kind outside the supported set.
    UnsupportedRelocationKind(u8),
    /// Name lookup failed.
    SymbolNotFound,
    /// The import table byte budget is exhausted.
    TableFull,
    /// Failure passed through from the host allocator.
    Host(HostError),
}

impl LoadError {
    /// Result code for this error.
    ///
    /// Host failures keep the host's own code.
    pub fn code(&self) -> i32 {
        match self {
            LoadError::InvalidArgument => -1,
            LoadError::InvalidFormat => -2,
            LoadError::MissingExecutableSegment => -3,
            LoadError::IncompleteDynamicInfo => -4,
            LoadError::UnsupportedRelocationKind(_) => -5,
            LoadError::SymbolNotFound => -6,
            LoadError::TableFull => -7,
            LoadError::Host(err) => err.0,
        }
    }
}

impl From<HostError> for LoadError {
    fn from(err: HostError) -> Self {
        LoadError::Host(err)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::InvalidArgument => write!(f, "Invalid argument"),
            LoadError::InvalidFormat => write!(f, "Invalid ELF image"),
            LoadError::MissingExecutableSegment => write!(f, "Executable segment missing"),
            LoadError::IncompleteDynamicInfo => write!(f, "Incomplete dynamic linking info"),
            LoadError::UnsupportedRelocationKind(kind) => {
                write!(f, "Unsupported relocation type {}", kind)
            }
            LoadError::SymbolNotFound => write!(f, "Symbol not found"),
            LoadError::TableFull => write!(f, "Import table full"),
            LoadError::Host(err) => write!(f, "{}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_codes_are_negative_and_distinct() {
        let errors = [
            LoadError::InvalidArgument,
            LoadError::InvalidFormat,
            LoadError::MissingExecutableSegment,
            LoadError::IncompleteDynamicInfo,
            LoadError::UnsupportedRelocationKind(3),
            LoadError::SymbolNotFound,
            LoadError::TableFull,
        ];

        for (i, a) in errors.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &errors[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn test_host_code_passes_through() {
        let err: LoadError = HostError(-0x7ffe_0000).into();
        assert_eq!(err.code(), -0x7ffe_0000);
        assert_eq!(
            LoadError::UnsupportedRelocationKind(28).to_string(),
            "Unsupported relocation type 28"
        );
    }
}
