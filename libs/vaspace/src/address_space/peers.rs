// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{AddressSpace, State};
use crate::capability::{Capability, CapabilitySet};
use crate::deferred::DeferredFreeList;
use crate::processor::{ProcessorId, ProcessorMask};
use crate::topology::{LinkClass, PeerLink};
use crate::{Error, Result};

impl AddressSpace {
    /// Makes two registered devices peers of each other.
    ///
    /// Bridged pairs hold a global reference for as long as they are enabled, the first such
    /// reference across all address spaces opens up physical access through the driver. Enabling an
    /// already enabled pair succeeds without taking another reference.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDevice`] if `a == b`, either device is not attached or not registered, or
    ///   the two are not connected at all.
    /// - [`Error::NotCompatible`] if both have VA contexts with different big page sizes.
    /// - Any error the driver or a memory range reports.
    pub fn enable_peer_access(&self, a: ProcessorId, b: ProcessorId) -> Result<()> {
        if a == b || !a.is_device() || !b.is_device() {
            return Err(Error::InvalidDevice);
        }
        let driver = self.global.driver();

        let link = {
            let mut global = self.global.lock();
            if global.topology.get(a).is_none() || global.topology.get(b).is_none() {
                return Err(Error::InvalidDevice);
            }
            let link = global.topology.peer_link(a, b);
            match link.class {
                LinkClass::None => return Err(Error::InvalidDevice),
                LinkClass::Bridged => global.topology.retain_peer_access(driver, a, b)?,
                LinkClass::Direct | LinkClass::DirectCoherent => {}
            }
            link
        };

        let mut deferred = DeferredFreeList::new();
        let res = {
            let mut state = self.state.write();
            if !state.registered_devices.test(a) || !state.registered_devices.test(b) {
                Err(Error::InvalidDevice)
            } else if state.enabled_peers.contains(a, b) {
                Ok(false)
            } else {
                state.enable_peers(a, b, link, &mut deferred).map(|()| true)
            }
        };

        deferred.drain(driver);

        let newly_enabled = matches!(res, Ok(true));
        if link.class == LinkClass::Bridged && !newly_enabled {
            self.global
                .lock()
                .topology
                .release_peer_access(driver, a, b);
        }

        match res {
            Ok(true) => log::debug!("enabled peers {a:?} and {b:?} in address space {}", self.id),
            Ok(false) => log::trace!("peers {a:?} and {b:?} already enabled"),
            Err(err) => log::warn!("failed to enable peers {a:?} and {b:?}: {err}"),
        }
        res.map(|_| ())
    }

    /// Tears down the peer relationship between two registered devices. Disabling a pair that is
    /// not enabled succeeds without doing anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] if `a == b` or either device is not registered.
    pub fn disable_peer_access(&self, a: ProcessorId, b: ProcessorId) -> Result<()> {
        if a == b || !a.is_device() || !b.is_device() {
            return Err(Error::InvalidDevice);
        }
        let driver = self.global.driver();

        let mut deferred = DeferredFreeList::new();
        let bridged = {
            let mut state = self.state.write();
            if !state.registered_devices.test(a) || !state.registered_devices.test(b) {
                return Err(Error::InvalidDevice);
            }
            if !state.enabled_peers.contains(a, b) {
                return Ok(());
            }
            let bridged = state.bridged_peers.contains(a, b);
            state.disable_peers(a, b, &mut deferred);
            bridged
        };

        deferred.drain(driver);

        // the pair's reference outlives the lock so the devices stay usable in between
        if bridged {
            self.global
                .lock()
                .topology
                .release_peer_access(driver, a, b);
        }

        log::debug!("disabled peers {a:?} and {b:?} in address space {}", self.id);
        Ok(())
    }

    pub fn peer_enabled(&self, a: ProcessorId, b: ProcessorId) -> bool {
        if a == b || !a.is_device() || !b.is_device() {
            return false;
        }
        self.state.read().enabled_peers.contains(a, b)
    }

    /// Picks the processor in `candidates` that `src` can reach fastest.
    ///
    /// The order of preference is: `src` itself, processors linked directly to `src` (those that
    /// route through host memory last), devices `src` can access, and finally the first candidate,
    /// which is the host whenever it is a candidate.
    pub fn find_closest_processor(
        &self,
        candidates: ProcessorMask,
        src: ProcessorId,
    ) -> Option<ProcessorId> {
        if candidates.test(src) {
            return Some(src);
        }

        let state = self.state.read();

        let linked = candidates.and(state.caps.row(Capability::DirectLink, src));
        let preferred = linked.and_not(state.caps.row(Capability::IndirectLink, src));
        if let Some(id) = preferred.first().or_else(|| linked.first()) {
            return Some(id);
        }

        if src.is_device() {
            let accessible = candidates
                .and(state.caps.row(Capability::CanAccess, src))
                .devices();
            if let Some(id) = accessible.first() {
                return Some(id);
            }
        }

        candidates.first()
    }
}

impl State {
    /// Sets up the capabilities of a new peer pair and tells every range about it.
    ///
    /// On failure the pair is left disabled with no capability bits set.
    pub(super) fn enable_peers(
        &mut self,
        a: ProcessorId,
        b: ProcessorId,
        link: PeerLink,
        deferred: &mut DeferredFreeList,
    ) -> Result<()> {
        if !self.registered_devices.test(a) || !self.registered_devices.test(b) {
            return Err(Error::InvalidDevice);
        }
        assert!(
            !self.enabled_peers.contains(a, b),
            "peers {a:?} and {b:?} are already enabled"
        );

        let big_pages_differ = match (&self.device_vas[a.get()], &self.device_vas[b.get()]) {
            (Some(va_a), Some(va_b)) => va_a.big_page_size() != va_b.big_page_size(),
            _ => false,
        };
        if big_pages_differ {
            return Err(Error::NotCompatible);
        }

        let (info_a, info_b) = (self.device(a).info(), self.device(b).info());

        let mut caps = CapabilitySet::CAN_ACCESS | CapabilitySet::ACCESSIBLE_FROM;
        if info_a.peer_identity_mappings && info_b.peer_identity_mappings {
            caps |= CapabilitySet::CAN_COPY_FROM;
        }
        if link.class.is_direct() {
            caps |= CapabilitySet::DIRECT_LINK | CapabilitySet::NATIVE_ATOMICS;
            if link.through_host_memory {
                caps |= CapabilitySet::INDIRECT_LINK;
            }
        }

        self.caps.set_pair(a, b, caps);
        self.enabled_peers.insert(a, b);
        if link.class == LinkClass::Bridged {
            self.bridged_peers.insert(a, b);
        }

        if let Err(err) = self
            .ranges
            .iter_mut()
            .try_for_each(|range| range.on_peer_enabled(a, b))
        {
            self.disable_peers(a, b, deferred);
            return Err(err);
        }

        log::trace!("peer capabilities {caps:?} set for {a:?} and {b:?}");
        Ok(())
    }

    /// Clears every capability between `a` and `b`. No-op if the pair is not enabled.
    ///
    /// The pair's global reference, if any, stays with the caller.
    pub(super) fn disable_peers(
        &mut self,
        a: ProcessorId,
        b: ProcessorId,
        deferred: &mut DeferredFreeList,
    ) {
        if !self.enabled_peers.contains(a, b) {
            return;
        }

        for range in &mut self.ranges {
            range.on_peer_disabled(a, b, deferred);
        }

        self.caps.clear_pair(a, b, CapabilitySet::all());
        self.enabled_peers.remove(a, b);
        self.bridged_peers.remove(a, b);
    }
}
