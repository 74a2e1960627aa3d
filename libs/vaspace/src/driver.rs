// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Result;
use crate::page_tree::PageTree;
use crate::topology::Device;

pub const BIG_PAGE_SIZE_64K: usize = 64 * 1024;
pub const BIG_PAGE_SIZE_128K: usize = 128 * 1024;

/// Identifies an address space object owned by a client of the privileged device driver.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ExternalVaHandle {
    pub client: u32,
    pub object: u32,
}

/// A private duplicate of an [`ExternalVaHandle`], owned by one device VA context.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DupedHandle(pub u64);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DupedAddressSpace {
    pub handle: DupedHandle,
    /// Whether the device translates addresses through the host's page tables.
    pub ats_enabled: bool,
    pub big_page_size: usize,
}

/// The operations the privileged device driver provides.
///
/// Implementations must be callable from any thread and may block.
pub trait Driver: Send + Sync {
    /// Duplicates the client's address space object so it outlives the client's handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle does not name an address space on `device`.
    fn dup_address_space(
        &self,
        device: &Device,
        handle: ExternalVaHandle,
    ) -> Result<DupedAddressSpace>;

    fn destroy_address_space(&self, device: &Device, handle: DupedHandle);

    /// Installs `root` as the page directory base of the duplicated address space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`][crate::Error::NotSupported] if the address space already has
    /// a page directory installed, or any other error the driver reports.
    fn set_page_directory(&self, device: &Device, handle: DupedHandle, root: &PageTree)
    -> Result<()>;

    fn unset_page_directory(&self, device: &Device, handle: DupedHandle);

    fn supports_big_page_size(&self, device: &Device, size: usize) -> bool {
        let _ = device;
        matches!(size, BIG_PAGE_SIZE_64K | BIG_PAGE_SIZE_128K)
    }

    /// Opens up physical peer access between two devices connected through a host bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the hardware cannot establish the mapping.
    fn grant_peer_access(&self, a: &Device, b: &Device) -> Result<()>;

    fn revoke_peer_access(&self, a: &Device, b: &Device);

    /// Flushes `device`'s replayable fault buffer so no pending fault references torn down state.
    fn flush_fault_buffer(&self, device: &Device);
}
