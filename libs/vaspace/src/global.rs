// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::format;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::address_space::AddressSpace;
use crate::config::Config;
use crate::driver::Driver;
use crate::lock::{LockRank, RankedMutex, RankedMutexGuard};
use crate::processor::ProcessorId;
use crate::topology::{Device, DeviceInfo, PeerLink, Topology};
use crate::work_queue::WorkQueue;
use crate::{Error, Result};

/// State shared by every address space: the attached devices, their interconnect topology and the
/// registry of live address spaces.
///
/// The global lock ranks above every address space lock. It may be held while taking an address
/// space lock, never the other way around.
pub struct Global {
    config: Config,
    driver: Arc<dyn Driver>,
    state: RankedMutex<GlobalState>,
    /// Background work that may touch any address space.
    deferred_work: WorkQueue,
    next_address_space_id: AtomicU64,
}

pub(crate) struct GlobalState {
    pub(crate) topology: Topology,
    address_spaces: Vec<(u64, Weak<AddressSpace>)>,
}

impl fmt::Debug for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Global")
            .field("config", &self.config)
            .field("deferred_work", &self.deferred_work)
            .finish_non_exhaustive()
    }
}

impl Global {
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] if the background worker could not be started.
    pub fn new(config: Config, driver: Arc<dyn Driver>) -> Result<Arc<Self>> {
        let deferred_work = WorkQueue::new(format!("{}-deferred", config.worker_name_prefix))?;

        Ok(Arc::new(Self {
            config,
            driver,
            state: RankedMutex::new(
                LockRank::Global,
                GlobalState {
                    topology: Topology::new(),
                    address_spaces: Vec::new(),
                },
            ),
            deferred_work,
            next_address_space_id: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn driver(&self) -> &dyn Driver {
        &*self.driver
    }

    pub fn deferred_work(&self) -> &WorkQueue {
        &self.deferred_work
    }

    pub(crate) fn lock(&self) -> RankedMutexGuard<'_, GlobalState> {
        self.state.lock()
    }

    /// Attaches a new device and returns its id.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDevice`] if all device ids are taken.
    /// - [`Error::NoMemory`] if the device's fault handling workers could not be started.
    pub fn attach_device(&self, info: DeviceInfo) -> Result<ProcessorId> {
        let mut state = self.lock();
        let id = state.topology.free_id().ok_or(Error::InvalidDevice)?;
        let device = Device::new(id, info, &self.config.worker_name_prefix)?;
        state.topology.attach(device)?;

        log::debug!("attached {id:?}");
        Ok(id)
    }

    /// Detaches a device no address space uses anymore.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] if the device is unknown or still registered somewhere.
    pub fn detach_device(&self, id: ProcessorId) -> Result<()> {
        let device = self.lock().topology.detach(id)?;
        log::debug!("detached {id:?}");
        // the device's workers are joined outside of the global lock
        drop(device);
        Ok(())
    }

    /// Records the interconnect between two attached devices.
    pub fn set_peer_link(&self, a: ProcessorId, b: ProcessorId, link: PeerLink) {
        self.lock().topology.set_peer_link(a, b, link);
    }

    pub fn peer_link(&self, a: ProcessorId, b: ProcessorId) -> PeerLink {
        self.lock().topology.peer_link(a, b)
    }

    pub fn device(&self, id: ProcessorId) -> Option<Arc<Device>> {
        self.lock().topology.get(id).cloned()
    }

    /// Number of address spaces holding a registration of `id`.
    pub fn device_retain_count(&self, id: ProcessorId) -> usize {
        self.lock().topology.retain_count(id)
    }

    /// Number of address spaces with bridged peer access between `a` and `b` enabled.
    pub fn peer_retain_count(&self, a: ProcessorId, b: ProcessorId) -> usize {
        self.lock().topology.peer_retain_count(a, b)
    }

    /// Creates a new, empty address space and makes it reachable through
    /// [`Global::address_spaces`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] if the registry could not grow.
    pub fn create_address_space(self: &Arc<Self>) -> Result<Arc<AddressSpace>> {
        let id = self.next_address_space_id.fetch_add(1, Ordering::Relaxed);
        let aspace = Arc::new(AddressSpace::new(self.clone(), id));

        let mut state = self.lock();
        state.address_spaces.retain(|(_, weak)| weak.strong_count() > 0);
        state.address_spaces.try_reserve(1)?;
        state.address_spaces.push((id, Arc::downgrade(&aspace)));

        log::debug!("created address space {id}");
        Ok(aspace)
    }

    /// Returns every address space that has not begun tearing down.
    pub fn address_spaces(&self) -> Vec<Arc<AddressSpace>> {
        self.lock()
            .address_spaces
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// Makes the address space `id` unreachable through the registry.
    pub(crate) fn unregister_address_space(&self, id: u64) -> bool {
        let mut state = self.lock();
        let before = state.address_spaces.len();
        state.address_spaces.retain(|(other, _)| *other != id);
        state.address_spaces.len() != before
    }
}
