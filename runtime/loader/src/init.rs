//! Initializer runner.

use alloc::vec::Vec;

use crate::error::LoadError;
use crate::host::PageAllocator;
use crate::image::{Image, Stage};

impl<A: PageAllocator + ?Sized> Image<'_, A> {
    /// Calls every non-null `.init_array` entry in order.
    ///
    /// # Safety
    ///
    /// The entries are executed as `extern "C" fn()` on the current thread.
    /// The image must be built for the running CPU and every import it calls
    /// must be bound, and instruction caches must already be synchronized.
    pub unsafe fn run_initializers(&mut self) -> Result<(), LoadError> {
        self.run_initializers_with(|address| {
            let init: extern "C" fn() = unsafe { core::mem::transmute(address) };
            init();
        })
    }

    /// Hands every non-null `.init_array` entry to `invoke`, in order.
    ///
    /// Hosts that must switch instruction-set state before calling into the
    /// image supply their own trampoline here.
    pub fn run_initializers_with<F: FnMut(usize)>(&mut self, mut invoke: F) -> Result<(), LoadError> {
        self.expect_stage(Stage::ImportsResolved)?;

        let layout = &self.layout;
        let entries = match layout.init_array {
            Some(table) => {
                let bytes = self.mapping.bytes();
                (0..table.count)
                    .map(|i| layout.read_word(bytes, table.addr + i * 4))
                    .collect::<Result<Vec<u32>, LoadError>>()?
            }
            None => Vec::new(),
        };

        let mut ran = 0usize;
        for entry in entries.into_iter().filter(|&entry| entry != 0) {
            log::trace!("initializer {:#x}", entry);
            invoke(entry as usize);
            ran += 1;
        }

        self.stage = Stage::Initialized;
        log::info!("{} initializers run", ran);
        Ok(())
    }
}
