// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The system-wide device table and the pairwise interconnect topology.
//!
//! Everything in here is protected by the global lock (see [`Global`][crate::Global]).

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use crate::driver::Driver;
use crate::processor::{MAX_DEVICES, MAX_PEER_PAIRS, MAX_PROCESSORS, ProcessorId, peer_pair_index};
use crate::work_queue::WorkQueue;
use crate::{Error, Result};

/// Class of the interconnect between two processors, weakest first.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LinkClass {
    /// No usable interconnect.
    #[default]
    None,
    /// Traffic crosses a host bridge. Peer access over such a link has to be granted by the driver.
    Bridged,
    /// A dedicated point-to-point link.
    Direct,
    /// A dedicated link that is also cache coherent with host memory.
    DirectCoherent,
}

impl LinkClass {
    /// Whether this link alone makes two devices peers.
    pub fn is_direct(self) -> bool {
        self >= LinkClass::Direct
    }

    /// Devices of different generations must not share an address space.
    pub fn generation(self) -> u8 {
        u8::from(self >= LinkClass::DirectCoherent)
    }
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct PeerLink {
    pub class: LinkClass,
    /// A direct link that nonetheless routes peer traffic through host memory.
    pub through_host_memory: bool,
}

/// Static description of a device, provided when it is attached.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    /// Link between the device and host memory.
    pub sysmem_link: LinkClass,
    /// The NUMA node device memory is exposed as, if it is exposed at all.
    pub numa_node: Option<u32>,
    /// The host NUMA node closest to the device.
    pub closest_cpu_numa_node: Option<u32>,
    pub replayable_faults: bool,
    pub non_replayable_faults: bool,
    pub access_counters: bool,
    /// Whether the device can map peer memory through identity mappings (and thus copy from it).
    pub peer_identity_mappings: bool,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sysmem_link: LinkClass::Bridged,
            numa_node: None,
            closest_cpu_numa_node: None,
            replayable_faults: false,
            non_replayable_faults: false,
            access_counters: false,
            peer_identity_mappings: true,
        }
    }

    #[must_use]
    pub fn with_sysmem_link(mut self, class: LinkClass) -> Self {
        self.sysmem_link = class;
        self
    }

    #[must_use]
    pub fn with_numa_node(mut self, node: u32) -> Self {
        self.numa_node = Some(node);
        self
    }

    #[must_use]
    pub fn with_closest_cpu_numa_node(mut self, node: u32) -> Self {
        self.closest_cpu_numa_node = Some(node);
        self
    }

    #[must_use]
    pub fn with_replayable_faults(mut self, enabled: bool) -> Self {
        self.replayable_faults = enabled;
        self
    }

    #[must_use]
    pub fn with_non_replayable_faults(mut self, enabled: bool) -> Self {
        self.non_replayable_faults = enabled;
        self
    }

    #[must_use]
    pub fn with_access_counters(mut self, enabled: bool) -> Self {
        self.access_counters = enabled;
        self
    }

    #[must_use]
    pub fn with_peer_identity_mappings(mut self, enabled: bool) -> Self {
        self.peer_identity_mappings = enabled;
        self
    }

    /// Whether any kind of fault or access-counter servicing runs for this device.
    pub fn handles_faults(&self) -> bool {
        self.replayable_faults || self.non_replayable_faults || self.access_counters
    }
}

/// An attached device.
pub struct Device {
    id: ProcessorId,
    info: DeviceInfo,
    /// Services fault interrupts.
    bottom_half: WorkQueue,
    /// Kills channels that hit non-replayable faults.
    kill_channel: Option<WorkQueue>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn new(id: ProcessorId, info: DeviceInfo, name_prefix: &str) -> Result<Self> {
        let bottom_half = WorkQueue::new(format!("{name_prefix}-bh-{}", id.get()))?;
        let kill_channel = if info.non_replayable_faults {
            Some(WorkQueue::new(format!("{name_prefix}-kill-{}", id.get()))?)
        } else {
            None
        };

        Ok(Self {
            id,
            info,
            bottom_half,
            kill_channel,
        })
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn bottom_half(&self) -> &WorkQueue {
        &self.bottom_half
    }

    pub fn kill_channel(&self) -> Option<&WorkQueue> {
        self.kill_channel.as_ref()
    }

    /// Waits for all fault servicing that may still reference an address space: the bottom half
    /// first, then the kill-channel queue it feeds.
    pub fn flush_fault_handling(&self) {
        if !self.info.handles_faults() {
            return;
        }
        self.bottom_half.flush();
        if let Some(queue) = &self.kill_channel {
            queue.flush();
        }
    }
}

struct DeviceSlot {
    device: Arc<Device>,
    retained: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct PairEntry {
    link: PeerLink,
    retained: usize,
}

/// The global device table together with per-pair link data and retain counts.
pub struct Topology {
    devices: [Option<DeviceSlot>; MAX_DEVICES],
    pairs: [PairEntry; MAX_PEER_PAIRS],
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field(
                "devices",
                &self
                    .devices
                    .iter()
                    .flatten()
                    .map(|slot| (slot.device.id, slot.retained))
                    .collect::<alloc::vec::Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        Self {
            devices: [const { None }; MAX_DEVICES],
            pairs: [PairEntry::default(); MAX_PEER_PAIRS],
        }
    }

    /// Adds `device` to the table and returns the shared handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] if the id is already taken.
    pub fn attach(&mut self, device: Device) -> Result<Arc<Device>> {
        let slot = &mut self.devices[device.id.get() - 1];
        if slot.is_some() {
            return Err(Error::InvalidDevice);
        }
        let device = Arc::new(device);
        *slot = Some(DeviceSlot {
            device: device.clone(),
            retained: 0,
        });
        Ok(device)
    }

    /// Returns the lowest device id not in use.
    pub fn free_id(&self) -> Option<ProcessorId> {
        let index = self.devices.iter().position(Option::is_none)?;
        ProcessorId::device(index + 1)
    }

    /// Removes a device nobody retains anymore.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] if the device is unknown or still retained.
    pub fn detach(&mut self, id: ProcessorId) -> Result<Arc<Device>> {
        let slot = self.slot_mut(id)?;
        if slot.as_ref().is_some_and(|slot| slot.retained > 0) {
            return Err(Error::InvalidDevice);
        }
        let slot = slot.take().ok_or(Error::InvalidDevice)?;

        for other in 1..=MAX_DEVICES {
            if other != id.get() {
                let pair = peer_pair_index(id, ProcessorId::from_index(other));
                self.pairs[pair] = PairEntry::default();
            }
        }

        Ok(slot.device)
    }

    pub fn get(&self, id: ProcessorId) -> Option<&Arc<Device>> {
        if !id.is_device() {
            return None;
        }
        self.devices[id.get() - 1].as_ref().map(|slot| &slot.device)
    }

    /// Looks up a device by id and takes a reference on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] if no such device is attached.
    pub fn retain_by_id(&mut self, id: ProcessorId) -> Result<Arc<Device>> {
        let slot = self.slot_mut(id)?.as_mut().ok_or(Error::InvalidDevice)?;
        slot.retained += 1;
        Ok(slot.device.clone())
    }

    /// Drops a reference taken by [`Topology::retain_by_id`].
    ///
    /// # Panics
    ///
    /// Panics if the device is not retained.
    pub fn release(&mut self, id: ProcessorId) {
        let slot = self.devices[id.get() - 1]
            .as_mut()
            .expect("released device is not attached");
        assert!(slot.retained > 0, "{id:?} released more often than retained");
        slot.retained -= 1;
    }

    pub fn retain_count(&self, id: ProcessorId) -> usize {
        self.devices
            .get(id.get().wrapping_sub(1))
            .and_then(Option::as_ref)
            .map_or(0, |slot| slot.retained)
    }

    pub fn set_peer_link(&mut self, a: ProcessorId, b: ProcessorId, link: PeerLink) {
        self.pairs[peer_pair_index(a, b)].link = link;
    }

    pub fn peer_link(&self, a: ProcessorId, b: ProcessorId) -> PeerLink {
        self.pairs[peer_pair_index(a, b)].link
    }

    /// Copies out the links between `id` and every other attached device, indexed by processor id.
    /// Slots of the host, `id` itself and free ids read [`LinkClass::None`].
    pub fn peer_links(&self, id: ProcessorId) -> [PeerLink; MAX_PROCESSORS] {
        let mut links = [PeerLink::default(); MAX_PROCESSORS];
        for slot in self.devices.iter().flatten() {
            let other = slot.device.id();
            if other != id {
                links[other.get()] = self.peer_link(id, other);
            }
        }
        links
    }

    /// Takes a global reference on the bridged peer access between `a` and `b`. The first reference
    /// across all address spaces asks the driver to open up physical access.
    ///
    /// # Errors
    ///
    /// Returns the driver's error if access could not be granted, in which case no reference is
    /// taken.
    pub fn retain_peer_access(
        &mut self,
        driver: &dyn Driver,
        a: ProcessorId,
        b: ProcessorId,
    ) -> Result<()> {
        let index = peer_pair_index(a, b);
        debug_assert_eq!(self.pairs[index].link.class, LinkClass::Bridged);

        if self.pairs[index].retained == 0 {
            let (dev_a, dev_b) = (
                self.get(a).ok_or(Error::InvalidDevice)?,
                self.get(b).ok_or(Error::InvalidDevice)?,
            );
            driver.grant_peer_access(dev_a, dev_b)?;
            log::trace!("granted physical peer access between {a:?} and {b:?}");
        }
        self.pairs[index].retained += 1;
        Ok(())
    }

    /// Drops a reference taken by [`Topology::retain_peer_access`], revoking physical access once
    /// the last one is gone.
    ///
    /// # Panics
    ///
    /// Panics if the pair is not retained.
    pub fn release_peer_access(&mut self, driver: &dyn Driver, a: ProcessorId, b: ProcessorId) {
        let index = peer_pair_index(a, b);
        let entry = &mut self.pairs[index];
        assert!(entry.retained > 0, "peer access {a:?}<->{b:?} released too often");
        entry.retained -= 1;
        if entry.retained > 0 {
            return;
        }

        if let (Some(dev_a), Some(dev_b)) = (self.get(a), self.get(b)) {
            driver.revoke_peer_access(dev_a, dev_b);
            log::trace!("revoked physical peer access between {a:?} and {b:?}");
        }
    }

    pub fn peer_retain_count(&self, a: ProcessorId, b: ProcessorId) -> usize {
        self.pairs[peer_pair_index(a, b)].retained
    }

    fn slot_mut(&mut self, id: ProcessorId) -> Result<&mut Option<DeviceSlot>> {
        if !id.is_device() {
            return Err(Error::InvalidDevice);
        }
        Ok(&mut self.devices[id.get() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDriver;

    fn dev(n: usize) -> ProcessorId {
        ProcessorId::device(n).unwrap()
    }

    fn attach(topology: &mut Topology, id: ProcessorId) -> Arc<Device> {
        let device = Device::new(id, DeviceInfo::new(format!("gpu{}", id.get())), "test").unwrap();
        topology.attach(device).unwrap()
    }

    #[test]
    fn link_classes_are_ordered() {
        assert!(LinkClass::None < LinkClass::Bridged);
        assert!(LinkClass::Direct.is_direct());
        assert!(!LinkClass::Bridged.is_direct());
        assert_ne!(LinkClass::Direct.generation(), LinkClass::DirectCoherent.generation());
        assert_eq!(LinkClass::Bridged.generation(), LinkClass::Direct.generation());
    }

    #[test]
    fn retain_and_release_devices() {
        let mut topology = Topology::new();
        attach(&mut topology, dev(1));

        assert_eq!(topology.retain_by_id(dev(2)).unwrap_err(), Error::InvalidDevice);
        assert_eq!(topology.retain_by_id(ProcessorId::HOST).unwrap_err(), Error::InvalidDevice);

        let device = topology.retain_by_id(dev(1)).unwrap();
        assert_eq!(device.id(), dev(1));
        assert_eq!(topology.retain_count(dev(1)), 1);

        // retained devices cannot go away
        assert_eq!(topology.detach(dev(1)).unwrap_err(), Error::InvalidDevice);

        topology.release(dev(1));
        assert_eq!(topology.retain_count(dev(1)), 0);
        topology.detach(dev(1)).unwrap();
        assert_eq!(topology.free_id(), Some(dev(1)));
    }

    #[test]
    fn bridged_peer_access_is_granted_once() {
        let driver = MockDriver::new();
        let mut topology = Topology::new();
        attach(&mut topology, dev(1));
        attach(&mut topology, dev(2));
        topology.set_peer_link(
            dev(1),
            dev(2),
            PeerLink {
                class: LinkClass::Bridged,
                through_host_memory: false,
            },
        );

        topology.retain_peer_access(&driver, dev(1), dev(2)).unwrap();
        topology.retain_peer_access(&driver, dev(2), dev(1)).unwrap();
        assert_eq!(driver.peer_grants(), 1);
        assert_eq!(topology.peer_retain_count(dev(1), dev(2)), 2);

        topology.release_peer_access(&driver, dev(1), dev(2));
        assert_eq!(driver.peer_revokes(), 0);
        topology.release_peer_access(&driver, dev(1), dev(2));
        assert_eq!(driver.peer_revokes(), 1);
    }

    #[test]
    fn failed_grant_takes_no_reference() {
        let driver = MockDriver::new().with_failing_peer_grants();
        let mut topology = Topology::new();
        attach(&mut topology, dev(1));
        attach(&mut topology, dev(2));
        topology.set_peer_link(
            dev(1),
            dev(2),
            PeerLink {
                class: LinkClass::Bridged,
                through_host_memory: false,
            },
        );

        assert_eq!(
            topology.retain_peer_access(&driver, dev(1), dev(2)),
            Err(Error::NoMemory)
        );
        assert_eq!(topology.peer_retain_count(dev(1), dev(2)), 0);
    }
}
