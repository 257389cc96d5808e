//! # Host memory seam
//!
//! The loader never maps memory itself. It asks a [`PageAllocator`] for
//! regions with a permission set, copies bytes into them, and brackets every
//! write with [`PageAllocator::open_writable`] / [`PageAllocator::close_writable`]
//! so hosts that forbid simultaneous write+execute can switch views.
//!
//! [`HeapPages`] is a reference allocator backed by the global heap. It is
//! what the tests use, and it is good enough for hosts without W^X rules.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeMap;

use bitflags::bitflags;
use spin::Mutex;

use crate::error::HostError;

bitflags! {
    /// Memory region permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Region is readable
        const READ = 1 << 0;
        /// Region is writable
        const WRITE = 1 << 1;
        /// Region is executable
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// Staging buffers.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Image memory: code and data share one block.
    pub const READ_WRITE_EXECUTE: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
}

/// A block of host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Host handle, opaque to the loader.
    pub id: u64,
    /// Base address.
    pub base: usize,
    /// Size in bytes.
    pub size: usize,
    /// Permissions granted at allocation.
    pub protection: Protection,
}

impl Region {
    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Whether `[addr, addr + len)` lies inside the region.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }
}

/// Page allocator and permission primitives supplied by the host.
///
/// # Safety
///
/// A region returned by `allocate` must be readable and writable for `size`
/// bytes starting at `base`, zero-filled, and stay valid until it is passed
/// to `free`. Regions must not overlap.
pub unsafe trait PageAllocator {
    /// Allocates `size` bytes with the given permissions.
    fn allocate(&self, name: &str, size: usize, protection: Protection) -> Result<Region, HostError>;

    /// Releases a region obtained from `allocate`.
    fn free(&self, region: &Region);

    /// Opens a writable view of `region`.
    fn open_writable(&self, _region: &Region) -> Result<(), HostError> {
        Ok(())
    }

    /// Closes the view opened by `open_writable`.
    fn close_writable(&self, _region: &Region) {}

    /// Makes instructions written to `[addr, addr + len)` visible to fetch.
    fn sync_instruction_cache(&self, region: &Region, addr: usize, len: usize) -> Result<(), HostError>;
}

// =============================================================================
// Scoped acquisitions
// =============================================================================

/// An allocated region, released on drop.
pub(crate) struct Mapping<'a, A: PageAllocator + ?Sized> {
    host: &'a A,
    region: Region,
}

impl<'a, A: PageAllocator + ?Sized> Mapping<'a, A> {
    pub fn allocate(host: &'a A, name: &str, size: usize, protection: Protection) -> Result<Self, HostError> {
        let region = host.allocate(name, size, protection)?;
        log::debug!(
            "allocated {} at {:#x} ({} bytes, {:?})",
            name,
            region.base,
            region.size,
            protection
        );
        Ok(Self { host, region })
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn host(&self) -> &'a A {
        self.host
    }

    pub fn bytes(&self) -> &[u8] {
        // `PageAllocator` guarantees the region is valid for its size.
        unsafe { core::slice::from_raw_parts(self.region.base as *const u8, self.region.size) }
    }

    /// Opens a writable view for the lifetime of the returned guard.
    pub fn writable(&mut self) -> Result<WritableView<'_, 'a, A>, HostError> {
        self.host.open_writable(&self.region)?;
        Ok(WritableView { mapping: self })
    }
}

impl<A: PageAllocator + ?Sized> Drop for Mapping<'_, A> {
    fn drop(&mut self) {
        log::debug!("releasing region at {:#x}", self.region.base);
        self.host.free(&self.region);
    }
}

/// Write access to a mapping, closed again on drop.
pub(crate) struct WritableView<'m, 'a, A: PageAllocator + ?Sized> {
    mapping: &'m mut Mapping<'a, A>,
}

impl<A: PageAllocator + ?Sized> WritableView<'_, '_, A> {
    pub fn bytes(&self) -> &[u8] {
        self.mapping.bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let region = self.mapping.region;
        // Exclusive through `&mut Mapping`; validity per `PageAllocator`.
        unsafe { core::slice::from_raw_parts_mut(region.base as *mut u8, region.size) }
    }
}

impl<A: PageAllocator + ?Sized> Drop for WritableView<'_, '_, A> {
    fn drop(&mut self) {
        self.mapping.host.close_writable(&self.mapping.region);
    }
}

// =============================================================================
// Heap-backed reference allocator
// =============================================================================

/// Allocation granularity of [`HeapPages`].
pub const HEAP_PAGE_SIZE: usize = 0x1000;

/// Error returned by [`HeapPages`] when the heap or its limit is exhausted.
pub const OUT_OF_MEMORY: HostError = HostError(-12);

struct HeapState {
    regions: BTreeMap<usize, Layout>,
    next_id: u64,
    in_use: usize,
    open_views: usize,
}

/// [`PageAllocator`] over the global allocator.
///
/// Permissions are recorded but not enforced, and cache synchronization is a
/// memory fence, so this suits hosts with coherent caches and no W^X policy.
pub struct HeapPages {
    state: Mutex<HeapState>,
    limit: Option<usize>,
}

impl HeapPages {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                regions: BTreeMap::new(),
                next_id: 1,
                in_use: 0,
                open_views: 0,
            }),
            limit: None,
        }
    }

    /// Fails any allocation that would push live bytes past `limit`.
    pub fn with_limit(limit: usize) -> Self {
        let mut pages = Self::new();
        pages.limit = Some(limit);
        pages
    }

    /// Number of regions not yet freed.
    pub fn live_regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Number of writable views currently open.
    pub fn open_views(&self) -> usize {
        self.state.lock().open_views
    }
}

impl Default for HeapPages {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeapPages {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (&base, &layout) in state.regions.iter() {
            unsafe { dealloc(base as *mut u8, layout) };
        }
        state.regions.clear();
    }
}

unsafe impl PageAllocator for HeapPages {
    fn allocate(&self, _name: &str, size: usize, protection: Protection) -> Result<Region, HostError> {
        if size == 0 {
            return Err(OUT_OF_MEMORY);
        }

        let mut state = self.state.lock();
        if let Some(limit) = self.limit {
            if state.in_use + size > limit {
                return Err(OUT_OF_MEMORY);
            }
        }

        let layout = Layout::from_size_align(size, HEAP_PAGE_SIZE).map_err(|_| OUT_OF_MEMORY)?;
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(OUT_OF_MEMORY);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.in_use += size;
        state.regions.insert(base as usize, layout);

        Ok(Region {
            id,
            base: base as usize,
            size,
            protection,
        })
    }

    fn free(&self, region: &Region) {
        let mut state = self.state.lock();
        if let Some(layout) = state.regions.remove(&region.base) {
            state.in_use -= layout.size();
            unsafe { dealloc(region.base as *mut u8, layout) };
        } else {
            log::warn!("free of unknown region {:#x}", region.base);
        }
    }

    fn open_writable(&self, _region: &Region) -> Result<(), HostError> {
        self.state.lock().open_views += 1;
        Ok(())
    }

    fn close_writable(&self, _region: &Region) {
        let mut state = self.state.lock();
        state.open_views = state.open_views.saturating_sub(1);
    }

    fn sync_instruction_cache(&self, _region: &Region, _addr: usize, _len: usize) -> Result<(), HostError> {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
