// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per (address space, device) contexts.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::driver::{Driver, DupedAddressSpace, ExternalVaHandle};
use crate::page_tree::PageTree;
use crate::processor::ProcessorId;
use crate::topology::Device;
use crate::{Error, Result};

/// Lifecycle of a [`DeviceVaContext`]. Transitions only ever go forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum DeviceVaState {
    /// Constructed but not yet visible in the address space.
    Init = 0,
    /// Registered and usable.
    Active = 1,
    /// Removed from the address space, waiting for its last reference to go away.
    Dead = 2,
}

impl DeviceVaState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Active,
            2 => Self::Dead,
            _ => unreachable!("invalid device VA state {value}"),
        }
    }
}

/// Counts removed contexts that have not been destroyed yet.
///
/// Teardown waits on this to know no other thread is still finishing a context of the dying
/// address space.
#[derive(Debug, Default)]
pub struct PendingDestructions {
    count: Mutex<usize>,
    drained: Condvar,
}

impl PendingDestructions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        assert!(*count > 0, "pending destruction counter underflow");
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    /// Blocks until at most `n` destructions are outstanding.
    pub fn wait_until_at_most(&self, n: usize) {
        let mut count = self.count.lock();
        while *count > n {
            self.drained.wait(&mut count);
        }
    }
}

/// The state an address space keeps for one device: the device's page table root and the channels
/// that execute in it.
pub struct DeviceVaContext {
    device: Arc<Device>,
    state: AtomicU8,
    duped: DupedAddressSpace,
    did_set_page_directory: AtomicBool,
    page_tree: Mutex<Option<PageTree>>,
    channels: ChannelRegistry,
    destroyed: AtomicBool,
    pending: Arc<PendingDestructions>,
}

impl fmt::Debug for DeviceVaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceVaContext")
            .field("device", &self.device.id())
            .field("state", &self.state())
            .field("ats_enabled", &self.duped.ats_enabled)
            .field("big_page_size", &self.duped.big_page_size)
            .finish_non_exhaustive()
    }
}

impl DeviceVaContext {
    /// Duplicates `handle` and installs a fresh page tree as its page directory.
    ///
    /// The returned context is in [`DeviceVaState::Init`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidFlags`] if the address space requires ATS while ATS is disabled, or uses a
    ///   big page size the driver does not support.
    /// - [`Error::InvalidDevice`] if the address space already has a page directory installed.
    /// - [`Error::NoMemory`] if the page tree could not be allocated.
    /// - Any error the driver reports while duplicating the handle.
    pub fn create(
        driver: &dyn Driver,
        config: &Config,
        device: Arc<Device>,
        handle: ExternalVaHandle,
        pending: Arc<PendingDestructions>,
    ) -> Result<Arc<Self>> {
        let duped = driver.dup_address_space(&device, handle)?;

        let this = Arc::new(Self {
            device,
            state: AtomicU8::new(DeviceVaState::Init as u8),
            duped,
            did_set_page_directory: AtomicBool::new(false),
            page_tree: Mutex::new(None),
            channels: ChannelRegistry::new(),
            destroyed: AtomicBool::new(false),
            pending,
        });

        match this.init(driver, config) {
            Ok(()) => Ok(this),
            Err(err) => {
                log::warn!(
                    "failed to create VA context for {:?}: {err}",
                    this.device.id()
                );
                this.destroy(driver);
                Err(err)
            }
        }
    }

    fn init(&self, driver: &dyn Driver, config: &Config) -> Result<()> {
        if self.duped.ats_enabled && !config.ats_supported {
            return Err(Error::InvalidFlags);
        }

        if !driver.supports_big_page_size(&self.device, self.duped.big_page_size) {
            return Err(Error::InvalidFlags);
        }

        let tree = PageTree::new(self.device.id(), self.duped.big_page_size)?;

        driver
            .set_page_directory(&self.device, self.duped.handle, &tree)
            .map_err(|err| match err {
                Error::NotSupported => Error::InvalidDevice,
                err => err,
            })?;
        self.did_set_page_directory.store(true, Ordering::Release);
        *self.page_tree.lock() = Some(tree);

        Ok(())
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn device_id(&self) -> ProcessorId {
        self.device.id()
    }

    pub fn state(&self) -> DeviceVaState {
        DeviceVaState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn ats_enabled(&self) -> bool {
        self.duped.ats_enabled
    }

    pub fn big_page_size(&self) -> usize {
        self.duped.big_page_size
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn did_set_page_directory(&self) -> bool {
        self.did_set_page_directory.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// INIT -> ACTIVE
    pub(crate) fn activate(&self) {
        let res = self.state.compare_exchange(
            DeviceVaState::Init as u8,
            DeviceVaState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(res.is_ok(), "activating a VA context in state {:?}", self.state());
    }

    /// ACTIVE -> DEAD. The context now counts as a pending destruction of its address space.
    pub(crate) fn mark_dead(&self) {
        self.pending.begin();
        let res = self.state.compare_exchange(
            DeviceVaState::Active as u8,
            DeviceVaState::Dead as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(res.is_ok(), "killing a VA context in state {:?}", self.state());
    }

    /// Releases every resource held by this context. Safe to call more than once.
    ///
    /// Must not be called with the owning address space's lock held, the driver may block.
    pub fn destroy(&self, driver: &dyn Driver) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug_assert!(
            self.state() != DeviceVaState::Active,
            "destroying an active VA context"
        );

        if self.did_set_page_directory.swap(false, Ordering::AcqRel) {
            driver.unset_page_directory(&self.device, self.duped.handle);
        }
        drop(self.page_tree.lock().take());
        driver.destroy_address_space(&self.device, self.duped.handle);

        log::trace!("destroyed VA context for {:?}", self.device.id());

        if self.state() == DeviceVaState::Dead {
            self.pending.finish();
        }
    }
}

impl Drop for DeviceVaContext {
    fn drop(&mut self) {
        debug_assert!(
            std::thread::panicking() || self.state() != DeviceVaState::Active,
            "active VA context for {:?} dropped",
            self.device.id()
        );
    }
}
