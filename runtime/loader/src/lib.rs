//! # so_loader: ARM shared-object loader
//!
//! Loads a 32-bit little-endian ARM ELF shared object into host memory,
//! links it against host-provided functions and lets the host patch its
//! functions before running its initializers.
//!
//! ## Pipeline
//!
//! ```text
//! Image::load ─> relocate ─> resolve_imports ─> [hook_*] ─> flush_instruction_cache ─> run_initializers
//! ```
//!
//! Each stage runs once and in order; calling one early or twice fails with
//! [`LoadError::InvalidArgument`]. After initialization the host calls into
//! the image through addresses from [`Image::resolve_symbol`].
//!
//! ## Host seam
//!
//! Memory comes from a [`PageAllocator`]. The loader asks for one
//! read/write staging region and one read/write/execute image region, and
//! brackets every write to image memory with a writable view so hosts with a
//! W^X policy can remap. [`HeapPages`] is a heap-backed implementation.
//!
//! ## Soft-float images
//!
//! Images built for the soft-float ABI pass floating-point values in integer
//! registers. [`shim::register`] adds trampolines for the usual `libm`
//! functions to an [`ImportTable`] so those calls land correctly.

#![no_std]

extern crate alloc;

pub mod config;
pub mod elf;
pub mod error;
pub mod hook;
pub mod host;
pub mod image;
pub mod imports;
pub mod init;
pub mod reloc;
pub mod shim;
pub mod symbol;

#[cfg(test)]
mod testing;

pub use config::LoaderConfig;
pub use error::{HostError, LoadError};
pub use host::{HeapPages, PageAllocator, Protection, Region};
pub use image::{Image, Segment, Stage};
pub use imports::{ImportBinding, ImportReport, ImportTable, MissingImportPolicy};
pub use symbol::{elf_hash, LookupStrategy};
