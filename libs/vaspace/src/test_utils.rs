// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod proptest;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::channel::{Aperture, Channel, InstancePtr};
use crate::config::Config;
use crate::deferred::DeferredFreeList;
use crate::device_va::DeviceVaContext;
use crate::driver::{BIG_PAGE_SIZE_64K, Driver, DupedAddressSpace, DupedHandle, ExternalVaHandle};
use crate::global::Global;
use crate::page_tree::PageTree;
use crate::processor::ProcessorId;
use crate::range::{ExternalMapping, MemoryRange};
use crate::topology::{Device, DeviceInfo, LinkClass, PeerLink};
use crate::{Error, Result};

// =============================================================================
// Driver
// =============================================================================

/// In-memory stand-in for the privileged device driver.
pub struct MockDriver {
    inner: Mutex<DriverState>,
    ats: bool,
    default_big_page_size: usize,
    fail_peer_grants: bool,
}

#[derive(Default)]
struct DriverState {
    next_handle: u64,
    /// Duplicated handle to the client object it was duplicated from.
    duplicates: HashMap<DupedHandle, ExternalVaHandle>,
    /// Client objects with a page directory installed.
    page_directories: HashSet<ExternalVaHandle>,
    big_page_sizes: HashMap<ExternalVaHandle, usize>,
    ats: HashMap<ExternalVaHandle, bool>,
    peer_grants: usize,
    peer_revokes: usize,
    fault_buffer_flushes: HashMap<ProcessorId, usize>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DriverState::default()),
            ats: false,
            default_big_page_size: BIG_PAGE_SIZE_64K,
            fail_peer_grants: false,
        }
    }

    /// Every duplicated address space reports ATS as `enabled`.
    pub fn with_ats(mut self, enabled: bool) -> Self {
        self.ats = enabled;
        self
    }

    pub fn with_big_page_size(mut self, size: usize) -> Self {
        self.default_big_page_size = size;
        self
    }

    pub fn with_failing_peer_grants(mut self) -> Self {
        self.fail_peer_grants = true;
        self
    }

    /// Overrides the big page size reported for one client object.
    pub fn set_big_page_size(&self, handle: ExternalVaHandle, size: usize) {
        self.inner.lock().big_page_sizes.insert(handle, size);
    }

    /// Overrides whether ATS is reported as enabled for one client object.
    pub fn set_ats(&self, handle: ExternalVaHandle, enabled: bool) {
        self.inner.lock().ats.insert(handle, enabled);
    }

    pub fn live_duplicates(&self) -> usize {
        self.inner.lock().duplicates.len()
    }

    pub fn installed_page_directories(&self) -> usize {
        self.inner.lock().page_directories.len()
    }

    pub fn peer_grants(&self) -> usize {
        self.inner.lock().peer_grants
    }

    pub fn peer_revokes(&self) -> usize {
        self.inner.lock().peer_revokes
    }

    pub fn fault_buffer_flushes(&self, device: ProcessorId) -> usize {
        self.inner
            .lock()
            .fault_buffer_flushes
            .get(&device)
            .copied()
            .unwrap_or(0)
    }
}

impl Driver for MockDriver {
    fn dup_address_space(
        &self,
        _device: &Device,
        handle: ExternalVaHandle,
    ) -> Result<DupedAddressSpace> {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let duped = DupedHandle(inner.next_handle);
        inner.duplicates.insert(duped, handle);

        Ok(DupedAddressSpace {
            handle: duped,
            ats_enabled: inner.ats.get(&handle).copied().unwrap_or(self.ats),
            big_page_size: inner
                .big_page_sizes
                .get(&handle)
                .copied()
                .unwrap_or(self.default_big_page_size),
        })
    }

    fn destroy_address_space(&self, _device: &Device, handle: DupedHandle) {
        let removed = self.inner.lock().duplicates.remove(&handle);
        assert!(removed.is_some(), "destroying unknown duplicate {handle:?}");
    }

    fn set_page_directory(
        &self,
        _device: &Device,
        handle: DupedHandle,
        _root: &PageTree,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let external = *inner.duplicates.get(&handle).ok_or(Error::InvalidDevice)?;
        if !inner.page_directories.insert(external) {
            return Err(Error::NotSupported);
        }
        Ok(())
    }

    fn unset_page_directory(&self, _device: &Device, handle: DupedHandle) {
        let mut inner = self.inner.lock();
        let external = inner.duplicates[&handle];
        assert!(inner.page_directories.remove(&external));
    }

    fn grant_peer_access(&self, _a: &Device, _b: &Device) -> Result<()> {
        if self.fail_peer_grants {
            return Err(Error::NoMemory);
        }
        self.inner.lock().peer_grants += 1;
        Ok(())
    }

    fn revoke_peer_access(&self, _a: &Device, _b: &Device) {
        self.inner.lock().peer_revokes += 1;
    }

    fn flush_fault_buffer(&self, device: &Device) {
        *self
            .inner
            .lock()
            .fault_buffer_flushes
            .entry(device.id())
            .or_default() += 1;
    }
}

// =============================================================================
// Channels, ranges & external mappings
// =============================================================================

/// Parks every thread that passes it until it is opened.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    waiting: usize,
    open: bool,
}

impl Gate {
    pub fn pass(&self) {
        let mut state = self.state.lock();
        state.waiting += 1;
        self.changed.notify_all();
        while !state.open {
            self.changed.wait(&mut state);
        }
        state.waiting -= 1;
    }

    /// Blocks until at least one thread is parked at the gate.
    pub fn wait_for_waiter(&self) {
        let mut state = self.state.lock();
        while state.waiting == 0 && !state.open {
            self.changed.wait(&mut state);
        }
    }

    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }
}

pub struct MockChannel {
    instance_ptr: InstancePtr,
    stops: AtomicUsize,
    destroyed: AtomicBool,
    /// Parks the next call to [`Channel::stop`].
    stop_gate: Mutex<Option<Arc<Gate>>>,
    /// Parks the call to [`Channel::destroy_detached`].
    destroy_gate: Mutex<Option<Arc<Gate>>>,
}

impl MockChannel {
    pub fn new(address: u64) -> Self {
        Self {
            instance_ptr: Self::instance_ptr_for(address),
            stops: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            stop_gate: Mutex::new(None),
            destroy_gate: Mutex::new(None),
        }
    }

    /// Makes the next [`Channel::stop`] wait at `gate`. Later stops pass straight through.
    pub fn hold_next_stop(&self, gate: Arc<Gate>) {
        *self.stop_gate.lock() = Some(gate);
    }

    /// Makes [`Channel::destroy_detached`] wait at `gate` before the channel counts as destroyed.
    pub fn hold_destroy(&self, gate: Arc<Gate>) {
        *self.destroy_gate.lock() = Some(gate);
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn instance_ptr_for(address: u64) -> InstancePtr {
        InstancePtr {
            address,
            aperture: Aperture::Vidmem,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stops.load(Ordering::SeqCst) > 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Channel for MockChannel {
    fn instance_ptr(&self) -> InstancePtr {
        self.instance_ptr
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let gate = self.stop_gate.lock().take();
        if let Some(gate) = gate {
            gate.pass();
        }
    }

    fn destroy_detached(&self) {
        let gate = self.destroy_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass();
        }
        assert!(self.is_stopped(), "channel destroyed without being stopped");
        assert!(
            !self.destroyed.swap(true, Ordering::SeqCst),
            "channel destroyed twice"
        );
    }
}

pub struct MockExternalMapping {
    freed: Arc<AtomicBool>,
}

impl MockExternalMapping {
    pub fn new() -> (Self, Arc<AtomicBool>) {
        let freed = Arc::new(AtomicBool::new(false));
        (
            Self {
                freed: freed.clone(),
            },
            freed,
        )
    }
}

impl ExternalMapping for MockExternalMapping {
    fn free(self: Box<Self>) {
        assert!(!self.freed.swap(true, Ordering::SeqCst));
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RangeEvent {
    DeviceUnregistered(ProcessorId),
    PeerEnabled(ProcessorId, ProcessorId),
    PeerDisabled(ProcessorId, ProcessorId),
    DeviceVaAdded(ProcessorId),
    DeviceVaRemoved(ProcessorId),
    Destroyed,
}

/// Observes and steers a [`MockRange`] after it was handed to an address space.
#[derive(Default)]
pub struct RangeMonitor {
    events: Mutex<Vec<RangeEvent>>,
    fail_peer_enable: AtomicBool,
    fail_device_va_add: AtomicBool,
    peer_enable_gate: Mutex<Option<Arc<Gate>>>,
    /// External mappings freed through deferred destruction so far.
    mappings_freed: Arc<AtomicUsize>,
}

impl RangeMonitor {
    pub fn events(&self) -> Vec<RangeEvent> {
        self.events.lock().clone()
    }

    pub fn fail_peer_enable(&self, fail: bool) {
        self.fail_peer_enable.store(fail, Ordering::SeqCst);
    }

    pub fn fail_device_va_add(&self, fail: bool) {
        self.fail_device_va_add.store(fail, Ordering::SeqCst);
    }

    /// Makes every peer-enable notification wait at `gate`.
    pub fn hold_peer_enable(&self, gate: Arc<Gate>) {
        *self.peer_enable_gate.lock() = Some(gate);
    }

    pub fn mappings_freed(&self) -> usize {
        self.mappings_freed.load(Ordering::SeqCst)
    }

    fn record(&self, event: RangeEvent) {
        self.events.lock().push(event);
    }
}

/// A memory range that records every notification. Disabling a peer pair leaves an external
/// mapping behind that has to go through deferred destruction.
pub struct MockRange {
    monitor: Arc<RangeMonitor>,
}

impl MockRange {
    pub fn new() -> (Box<Self>, Arc<RangeMonitor>) {
        let monitor = Arc::new(RangeMonitor::default());
        (
            Box::new(Self {
                monitor: monitor.clone(),
            }),
            monitor,
        )
    }
}

struct CountedMapping(Arc<AtomicUsize>);

impl ExternalMapping for CountedMapping {
    fn free(self: Box<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl MemoryRange for MockRange {
    fn on_device_unregistered(&mut self, device: ProcessorId, _deferred: &mut DeferredFreeList) {
        self.monitor.record(RangeEvent::DeviceUnregistered(device));
    }

    fn on_peer_enabled(&mut self, a: ProcessorId, b: ProcessorId) -> Result<()> {
        let gate = self.monitor.peer_enable_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass();
        }
        if self.monitor.fail_peer_enable.load(Ordering::SeqCst) {
            return Err(Error::NoMemory);
        }
        self.monitor.record(RangeEvent::PeerEnabled(a, b));
        Ok(())
    }

    fn on_peer_disabled(
        &mut self,
        a: ProcessorId,
        b: ProcessorId,
        deferred: &mut DeferredFreeList,
    ) {
        self.monitor.record(RangeEvent::PeerDisabled(a, b));
        let mapping = CountedMapping(self.monitor.mappings_freed.clone());
        deferred.push_external_mapping(Box::new(mapping));
    }

    fn on_device_va_added(&mut self, context: &DeviceVaContext) -> Result<()> {
        if self.monitor.fail_device_va_add.load(Ordering::SeqCst) {
            return Err(Error::NoMemory);
        }
        self.monitor.record(RangeEvent::DeviceVaAdded(context.device_id()));
        Ok(())
    }

    fn on_device_va_removed(
        &mut self,
        context: &DeviceVaContext,
        _deferred: &mut DeferredFreeList,
    ) {
        self.monitor.record(RangeEvent::DeviceVaRemoved(context.device_id()));
    }

    fn destroy(self: Box<Self>, _deferred: &mut DeferredFreeList) {
        self.monitor.record(RangeEvent::Destroyed);
    }
}

// =============================================================================
// Setup helpers
// =============================================================================

pub fn test_device(n: usize) -> Arc<Device> {
    test_device_with(n, DeviceInfo::new(format!("gpu{n}")))
}

pub fn test_device_with(n: usize, info: DeviceInfo) -> Arc<Device> {
    let id = ProcessorId::device(n).unwrap();
    Arc::new(Device::new(id, info, "test").unwrap())
}

pub fn va_handle(object: u32) -> ExternalVaHandle {
    ExternalVaHandle { client: 1, object }
}

/// A [`Global`] backed by a [`MockDriver`] with the given devices attached.
pub struct TestSystem {
    pub global: Arc<Global>,
    pub driver: Arc<MockDriver>,
    pub devices: Vec<ProcessorId>,
}

impl TestSystem {
    pub fn new(devices: impl IntoIterator<Item = DeviceInfo>) -> Self {
        Self::with(Config::default(), MockDriver::new(), devices)
    }

    pub fn with(
        config: Config,
        driver: MockDriver,
        devices: impl IntoIterator<Item = DeviceInfo>,
    ) -> Self {
        let driver = Arc::new(driver);
        let global = Global::new(config, driver.clone()).unwrap();
        let devices = devices
            .into_iter()
            .map(|info| global.attach_device(info).unwrap())
            .collect();

        Self {
            global,
            driver,
            devices,
        }
    }

    /// `n` plain devices connected to each other through host bridges.
    pub fn bridged(n: usize) -> Self {
        let this = Self::new((1..=n).map(|i| DeviceInfo::new(format!("gpu{i}"))));
        this.link_all(LinkClass::Bridged);
        this
    }

    pub fn link_all(&self, class: LinkClass) {
        for (i, a) in self.devices.iter().enumerate() {
            for b in &self.devices[i + 1..] {
                self.link(*a, *b, class, false);
            }
        }
    }

    pub fn link(
        &self,
        a: ProcessorId,
        b: ProcessorId,
        class: LinkClass,
        through_host_memory: bool,
    ) {
        self.global.set_peer_link(
            a,
            b,
            PeerLink {
                class,
                through_host_memory,
            },
        );
    }
}
