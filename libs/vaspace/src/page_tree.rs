// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;

use crate::Result;
use crate::processor::ProcessorId;

/// Number of entries in a page tree's root directory.
pub const ROOT_ENTRIES: usize = 512;

/// The root of a device page table.
///
/// Only the root is owned here, lower levels are built and walked by the memory range layer.
#[derive(Debug)]
pub struct PageTree {
    device: ProcessorId,
    big_page_size: usize,
    root: Vec<u64>,
}

impl PageTree {
    /// Allocates an empty root directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`][crate::Error::NoMemory] if the root could not be allocated.
    pub fn new(device: ProcessorId, big_page_size: usize) -> Result<Self> {
        let mut root = Vec::new();
        root.try_reserve_exact(ROOT_ENTRIES)?;
        root.resize(ROOT_ENTRIES, 0);

        Ok(Self {
            device,
            big_page_size,
            root,
        })
    }

    pub fn device(&self) -> ProcessorId {
        self.device
    }

    pub fn big_page_size(&self) -> usize {
        self.big_page_size
    }

    /// Address of the root directory as handed to the driver.
    pub fn root_address(&self) -> usize {
        self.root.as_ptr() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.root.iter().all(|entry| *entry == 0)
    }
}
