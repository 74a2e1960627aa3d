// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-process address space.
//!
//! # Locking
//!
//! All mutable state lives behind one reader/writer lock. Operations that have to call out to
//! channels (stopping them may block on the hardware) do so while holding the lock *shared*, then
//! release it entirely and re-acquire it exclusively. Everything observed before the release is
//! re-validated afterwards because another thread may have won a competing operation in between.
//!
//! Objects that must be destroyed as a result of an operation are collected on a
//! [`DeferredFreeList`] while the lock is held and destroyed after it has been dropped.

mod peers;
mod teardown;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::affinity::AffinityTable;
use crate::capability::{CapabilitySet, PeerCapabilities};
use crate::channel::{Channel, InstancePtr};
use crate::deferred::DeferredFreeList;
use crate::device_va::{DeviceVaContext, DeviceVaState, PendingDestructions};
use crate::driver::ExternalVaHandle;
use crate::global::Global;
use crate::lock::{LockRank, RankedRwLock};
use crate::processor::{MAX_PROCESSORS, PeerPairSet, ProcessorId, ProcessorMask};
use crate::range::MemoryRange;
use crate::topology::{Device, LinkClass, PeerLink};
use crate::{Error, Result};

pub struct AddressSpace {
    id: u64,
    global: Arc<Global>,
    state: RankedRwLock<State>,
    pending: Arc<PendingDestructions>,
    /// Latched once teardown stopped every channel.
    channels_stopped: AtomicBool,
    destroyed: AtomicBool,
}

struct State {
    registered_devices: ProcessorMask,
    /// Devices with an active [`DeviceVaContext`].
    registered_device_vas: ProcessorMask,
    /// Devices some thread is currently unregistering.
    unregister_in_progress: ProcessorMask,
    /// Processors whose faults can be serviced on demand.
    faultable: ProcessorMask,
    system_wide_atomics: ProcessorMask,
    caps: PeerCapabilities,
    enabled_peers: PeerPairSet,
    /// The subset of `enabled_peers` holding a global bridged peer access reference.
    bridged_peers: PeerPairSet,
    devices: [Option<Arc<Device>>; MAX_PROCESSORS],
    device_vas: [Option<Arc<DeviceVaContext>>; MAX_PROCESSORS],
    affinity: AffinityTable,
    ranges: Vec<Box<dyn MemoryRange>>,
    /// Set once teardown started, no new devices or contexts are accepted afterwards.
    disallow_new_registers: bool,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("registered_devices", &state.registered_devices)
            .field("registered_device_vas", &state.registered_device_vas)
            .field("enabled_peers", &state.enabled_peers)
            .field("ranges", &state.ranges.len())
            .field("pending_destructions", &self.pending.count())
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    pub(crate) fn new(global: Arc<Global>, id: u64) -> Self {
        Self {
            id,
            global,
            state: RankedRwLock::new(LockRank::AddressSpace, State::new()),
            pending: Arc::new(PendingDestructions::new()),
            channels_stopped: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn global(&self) -> &Arc<Global> {
        &self.global
    }

    /// Registers an attached device with this address space.
    ///
    /// Every already registered device sharing a direct link with the new one becomes its peer.
    /// Returns the NUMA node the device's memory is exposed as, if any.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDevice`] if the device is not attached, already registered, or of a link
    ///   generation that cannot share an address space with the registered devices.
    /// - [`Error::PageTableUnavailable`] if the address space is being torn down.
    /// - Any error a memory range reports while enabling direct peers.
    pub fn register_device(&self, id: ProcessorId) -> Result<Option<u32>> {
        let driver = self.global.driver();

        // range callbacks run below without the global lock, so take what we need now
        let (device, links) = {
            let mut global = self.global.lock();
            let device = global.topology.retain_by_id(id)?;
            (device, global.topology.peer_links(id))
        };

        let mut deferred = DeferredFreeList::new();
        let res = self.state.write().register_device(&device, &links, &mut deferred);
        if res.is_err() {
            self.global.lock().topology.release(id);
        }

        deferred.drain(driver);

        match res {
            Ok(numa_node) => {
                log::debug!("registered {id:?} in address space {}", self.id);
                Ok(numa_node)
            }
            Err(err) => {
                log::warn!("failed to register {id:?} in address space {}: {err}", self.id);
                Err(err)
            }
        }
    }

    /// Unregisters a device, tearing down its VA context and every peer pair it is part of.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] if the device is not registered, another thread is already
    /// unregistering it, or teardown took it away while its channels were being stopped.
    pub fn unregister_device(&self, id: ProcessorId) -> Result<()> {
        let driver = self.global.driver();

        let mut state = self.state.write();
        if !id.is_device()
            || !state.registered_devices.test(id)
            || state.unregister_in_progress.test(id)
        {
            return Err(Error::InvalidDevice);
        }
        state.unregister_in_progress.set(id);

        // stopping channels may block, let readers in while it happens
        let state = state.downgrade();
        if let Some(context) = state.device_va(id) {
            log::trace!("stopping channels of {id:?} before unregistering it");
            context.channels().stop_all();
        }
        drop(state);

        let mut deferred = DeferredFreeList::new();
        let res = {
            let mut state = self.state.write();
            state.unregister_in_progress.clear(id);
            if state.registered_devices.test(id) {
                Ok(state.unregister_device(id, &mut deferred))
            } else {
                // teardown unregistered it (and owns the references) while the lock was dropped
                Err(Error::InvalidDevice)
            }
        };

        deferred.drain(driver);

        let bridged = match res {
            Ok(bridged) => bridged,
            Err(err) => {
                log::warn!("{id:?} vanished from address space {} during unregistration", self.id);
                return Err(err);
            }
        };

        let mut global = self.global.lock();
        for (a, b) in bridged.iter() {
            global.topology.release_peer_access(driver, a, b);
        }
        global.topology.release(id);
        drop(global);

        log::debug!("unregistered {id:?} from address space {}", self.id);
        Ok(())
    }

    /// Creates the VA context of a registered device from the client's address space object.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDevice`] if the device is not registered, already has a context, is being
    ///   unregistered, or `handle` already has a page directory installed.
    /// - [`Error::InvalidFlags`] if the context's ATS setting differs from the other contexts, ATS
    ///   is disabled globally, or the big page size is not supported.
    /// - [`Error::NotCompatible`] if the big page size differs from that of a peer's context.
    /// - [`Error::PageTableUnavailable`] if the address space is being torn down.
    /// - [`Error::NoMemory`] if the page tree could not be allocated.
    pub fn register_device_va(&self, id: ProcessorId, handle: ExternalVaHandle) -> Result<()> {
        let driver = self.global.driver();

        let device = self
            .state
            .read()
            .registered_device(id)
            .ok_or(Error::InvalidDevice)?;

        let context = DeviceVaContext::create(
            driver,
            self.global.config(),
            device,
            handle,
            self.pending.clone(),
        )?;

        let mut deferred = DeferredFreeList::new();
        let res = self.state.write().add_device_va(&context, &mut deferred);

        if context.state() == DeviceVaState::Init {
            debug_assert!(res.is_err());
            context.destroy(driver);
        }
        deferred.drain(driver);

        match res {
            Ok(()) => log::debug!("registered VA context of {id:?} in address space {}", self.id),
            Err(err) => log::warn!(
                "failed to register VA context of {id:?} in address space {}: {err}",
                self.id
            ),
        }
        res
    }

    /// Removes the VA context of a device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] if the device has no active context or another thread
    /// removed it while its channels were being stopped.
    pub fn unregister_device_va(&self, id: ProcessorId) -> Result<()> {
        let context = {
            let state = self.state.read();
            let context = state.device_va(id).ok_or(Error::InvalidDevice)?;
            log::trace!("stopping channels of {id:?} before removing its VA context");
            context.channels().stop_all();
            context
        };

        let mut deferred = DeferredFreeList::new();
        {
            let mut state = self.state.write();
            if context.state() == DeviceVaState::Dead {
                log::warn!("VA context of {id:?} was removed concurrently");
                return Err(Error::InvalidDevice);
            }
            state.remove_device_va(&context, &mut deferred);
        }
        drop(context);

        deferred.drain(self.global.driver());

        log::debug!("removed VA context of {id:?} from address space {}", self.id);
        Ok(())
    }

    /// Binds a channel to the active VA context of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] if the device has no active context, the context stopped
    /// accepting channels or the address space is being torn down.
    pub fn register_channel(&self, id: ProcessorId, channel: Arc<dyn Channel>) -> Result<()> {
        let state = self.state.read();
        if self.channels_stopped.load(Ordering::Acquire) {
            return Err(Error::InvalidDevice);
        }
        let context = state.device_va(id).ok_or(Error::InvalidDevice)?;
        context.channels().register(channel)
    }

    pub fn find_channel(
        &self,
        id: ProcessorId,
        instance_ptr: InstancePtr,
    ) -> Option<Arc<dyn Channel>> {
        self.state.read().device_va(id)?.channels().find(instance_ptr)
    }

    /// Adds a memory range. Ranges added after teardown started are destroyed right away.
    pub fn insert_range(&self, range: Box<dyn MemoryRange>) {
        let mut state = self.state.write();
        if !state.disallow_new_registers {
            state.ranges.push(range);
            return;
        }
        drop(state);

        log::warn!("address space {} is being torn down, dropping new range", self.id);
        let mut deferred = DeferredFreeList::new();
        range.destroy(&mut deferred);
        deferred.drain(self.global.driver());
    }

    /// Refuses all further device and VA context registrations.
    pub fn disallow_new_registrations(&self) {
        self.state.write().disallow_new_registers = true;
    }

    /// Whether read duplication may be enabled, treating `changing` as if its VA context
    /// registration was already flipped.
    ///
    /// Read duplication needs every device with an active VA context to be faultable.
    pub fn can_read_duplicate(&self, changing: Option<ProcessorId>) -> bool {
        let state = self.state.read();
        let mut device_vas = state.registered_device_vas;
        if let Some(id) = changing {
            if device_vas.test(id) {
                device_vas.clear(id);
            } else {
                device_vas.set(id);
            }
        }
        device_vas.and_not(state.faultable).is_empty()
    }

    pub fn registered_devices(&self) -> ProcessorMask {
        self.state.read().registered_devices
    }

    pub fn registered_device_vas(&self) -> ProcessorMask {
        self.state.read().registered_device_vas
    }

    pub fn faultable_processors(&self) -> ProcessorMask {
        self.state.read().faultable
    }

    pub fn system_wide_atomics_processors(&self) -> ProcessorMask {
        self.state.read().system_wide_atomics
    }

    pub fn capabilities(&self) -> PeerCapabilities {
        self.state.read().caps.clone()
    }

    pub fn enabled_peer_pairs(&self) -> PeerPairSet {
        self.state.read().enabled_peers
    }

    pub fn affinity(&self) -> AffinityTable {
        self.state.read().affinity.clone()
    }

    pub fn device_va(&self, id: ProcessorId) -> Option<Arc<DeviceVaContext>> {
        self.state.read().device_va(id)
    }

    pub fn pending_destructions(&self) -> usize {
        self.pending.count()
    }

    /// Checks every structural invariant of the address space.
    ///
    /// # Panics
    ///
    /// Panics if an invariant is broken.
    pub fn assert_invariants(&self) {
        self.state.read().assert_invariants();
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl State {
    fn new() -> Self {
        Self {
            registered_devices: ProcessorMask::new(),
            registered_device_vas: ProcessorMask::new(),
            unregister_in_progress: ProcessorMask::new(),
            faultable: ProcessorMask::new(),
            system_wide_atomics: ProcessorMask::new(),
            caps: PeerCapabilities::new(),
            enabled_peers: PeerPairSet::new(),
            bridged_peers: PeerPairSet::new(),
            devices: [const { None }; MAX_PROCESSORS],
            device_vas: [const { None }; MAX_PROCESSORS],
            affinity: AffinityTable::new(),
            ranges: Vec::new(),
            disallow_new_registers: false,
        }
    }

    fn registered_device(&self, id: ProcessorId) -> Option<Arc<Device>> {
        if !id.is_device() {
            return None;
        }
        self.devices[id.get()].clone()
    }

    fn device(&self, id: ProcessorId) -> &Arc<Device> {
        self.devices[id.get()]
            .as_ref()
            .unwrap_or_else(|| panic!("{id:?} is registered but has no device"))
    }

    /// The active VA context of `id`, if any.
    fn device_va(&self, id: ProcessorId) -> Option<Arc<DeviceVaContext>> {
        if !id.is_device() {
            return None;
        }
        let context = self.device_vas[id.get()].as_ref()?;
        debug_assert_eq!(context.state(), DeviceVaState::Active);
        Some(context.clone())
    }

    fn register_device(
        &mut self,
        device: &Arc<Device>,
        links: &[PeerLink; MAX_PROCESSORS],
        deferred: &mut DeferredFreeList,
    ) -> Result<Option<u32>> {
        let id = device.id();
        let info = device.info();

        if self.registered_devices.test(id) {
            return Err(Error::InvalidDevice);
        }

        let generation = info.sysmem_link.generation();
        if self
            .registered_devices
            .iter()
            .any(|other| self.device(other).info().sysmem_link.generation() != generation)
        {
            return Err(Error::InvalidDevice);
        }

        if self.disallow_new_registers {
            return Err(Error::PageTableUnavailable);
        }

        self.add_device(device);

        let registered = self.registered_devices;
        for other in registered.iter().filter(|other| *other != id) {
            let link = links[other.get()];
            if !link.class.is_direct() {
                continue;
            }

            if let Err(err) = self.enable_peers(id, other, link, deferred) {
                let bridged = self.unregister_device(id, deferred);
                debug_assert!(bridged.is_empty());
                return Err(err);
            }
        }

        Ok(info.numa_node)
    }

    /// Sets up the capability bits of a newly registered device.
    fn add_device(&mut self, device: &Arc<Device>) {
        let id = device.id();
        let info = device.info();
        let host = ProcessorId::HOST;

        if info.replayable_faults {
            self.faultable.set(id);
            self.system_wide_atomics.set(id);
        }

        self.caps.set_self(
            id,
            CapabilitySet::CAN_ACCESS
                | CapabilitySet::ACCESSIBLE_FROM
                | CapabilitySet::CAN_COPY_FROM
                | CapabilitySet::NATIVE_ATOMICS,
        );

        if info.sysmem_link.is_direct() {
            self.caps.grant_edge(id, host, CapabilitySet::DIRECT_LINK);
            self.caps.grant_edge(host, id, CapabilitySet::DIRECT_LINK);
        }

        if info.sysmem_link >= LinkClass::DirectCoherent {
            self.caps.grant_edge(id, host, CapabilitySet::NATIVE_ATOMICS);

            // host can reach device memory exposed as a NUMA node
            if info.numa_node.is_some() {
                self.caps.grant_access(host, id);
                self.caps.grant_edge(host, id, CapabilitySet::NATIVE_ATOMICS);
            }
        }

        self.caps.grant_access(id, host);
        self.caps.grant_edge(id, host, CapabilitySet::CAN_COPY_FROM);
        self.caps.grant_edge(host, id, CapabilitySet::CAN_COPY_FROM);

        self.registered_devices.set(id);
        self.devices[id.get()] = Some(device.clone());

        if let Some(node) = info.closest_cpu_numa_node {
            self.affinity.insert(node, id);
        }
    }

    /// Removes every trace of `id` from the address space.
    ///
    /// Returns the bridged peer pairs whose global references the caller has to release once the
    /// address space lock is dropped.
    fn unregister_device(
        &mut self,
        id: ProcessorId,
        deferred: &mut DeferredFreeList,
    ) -> PeerPairSet {
        assert!(self.registered_devices.test(id), "{id:?} is not registered");

        if let Some(context) = self.device_va(id) {
            self.remove_device_va(&context, deferred);
        }

        for range in &mut self.ranges {
            range.on_device_unregistered(id, deferred);
        }

        let mut bridged = PeerPairSet::new();
        for other in self.registered_devices.devices() {
            if other == id || !self.enabled_peers.contains(id, other) {
                continue;
            }
            if self.bridged_peers.contains(id, other) {
                bridged.insert(id, other);
            }
            self.disable_peers(id, other, deferred);
        }

        self.faultable.clear(id);
        self.system_wide_atomics.clear(id);

        self.caps.clear_processor(id);
        assert!(self.caps.is_clear(id));

        self.registered_devices.clear(id);
        let device = self.devices[id.get()].take();

        if let Some(node) = device.and_then(|device| device.info().closest_cpu_numa_node) {
            self.affinity.remove(node, id);
        }

        bridged
    }

    /// Validates a freshly created context against the address space and activates it.
    fn add_device_va(
        &mut self,
        context: &Arc<DeviceVaContext>,
        deferred: &mut DeferredFreeList,
    ) -> Result<()> {
        let id = context.device_id();

        if !self.registered_devices.test(id)
            || self.device_vas[id.get()].is_some()
            || self.unregister_in_progress.test(id)
        {
            return Err(Error::InvalidDevice);
        }

        if self.disallow_new_registers {
            return Err(Error::PageTableUnavailable);
        }

        for other in self.registered_device_vas {
            let other_context = self.device_vas[other.get()]
                .as_ref()
                .unwrap_or_else(|| {
                    panic!("{other:?} has a registered VA context but none is indexed")
                });

            if other_context.ats_enabled() != context.ats_enabled() {
                return Err(Error::InvalidFlags);
            }

            if self.enabled_peers.contains(id, other)
                && other_context.big_page_size() != context.big_page_size()
            {
                return Err(Error::NotCompatible);
            }
        }

        context.activate();
        self.registered_device_vas.set(id);
        self.device_vas[id.get()] = Some(context.clone());

        if let Err(err) = self
            .ranges
            .iter_mut()
            .try_for_each(|range| range.on_device_va_added(context))
        {
            self.remove_device_va(context, deferred);
            return Err(err);
        }

        Ok(())
    }

    /// Unlinks an active context and queues it for destruction. No-op for contexts that are not
    /// active.
    fn remove_device_va(
        &mut self,
        context: &Arc<DeviceVaContext>,
        deferred: &mut DeferredFreeList,
    ) {
        if context.state() != DeviceVaState::Active {
            return;
        }
        let id = context.device_id();

        for channel in context.channels().detach_all() {
            deferred.push_channel(channel, context.device().clone());
        }

        for range in &mut self.ranges {
            range.on_device_va_removed(context, deferred);
        }

        self.registered_device_vas.clear(id);
        self.device_vas[id.get()] = None;

        context.mark_dead();
        deferred.push_device_va(context.clone());
    }

    fn assert_invariants(&self) {
        self.caps.assert_consistent(self.registered_devices);

        assert!(!self.registered_devices.test(ProcessorId::HOST));
        assert_eq!(
            self.registered_device_vas.and_not(self.registered_devices),
            ProcessorMask::new(),
            "VA contexts of unregistered devices"
        );
        assert_eq!(
            self.faultable.and_not(self.registered_devices),
            ProcessorMask::new(),
            "unregistered devices are faultable"
        );

        for (a, b) in self.enabled_peers.iter() {
            assert!(
                self.registered_devices.test(a) && self.registered_devices.test(b),
                "peers {a:?} and {b:?} enabled but not both registered"
            );
        }
        for (a, b) in self.bridged_peers.iter() {
            assert!(self.enabled_peers.contains(a, b));
        }

        for id in (0..MAX_PROCESSORS).map(ProcessorId::from_index) {
            assert_eq!(self.devices[id.get()].is_some(), self.registered_devices.test(id));
            match &self.device_vas[id.get()] {
                Some(context) => {
                    assert!(self.registered_device_vas.test(id));
                    assert_eq!(context.state(), DeviceVaState::Active);
                    assert_eq!(context.device_id(), id);
                }
                None => assert!(!self.registered_device_vas.test(id)),
            }
        }

        for entry in self.affinity.entries() {
            assert_eq!(
                entry.devices.and_not(self.registered_devices),
                ProcessorMask::new(),
                "affinity entry for node {} lists unregistered devices",
                entry.numa_node
            );
        }
    }
}
