// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::Ordering;

use super::AddressSpace;
use crate::deferred::DeferredFreeList;
use crate::processor::{PeerPairSet, ProcessorMask};
use crate::topology::Device;

impl AddressSpace {
    /// Tears the address space down.
    ///
    /// Afterwards no device is registered, every range and context is destroyed and every global
    /// reference the address space held is released. Operations racing with teardown fail with
    /// [`Error::InvalidDevice`][crate::Error::InvalidDevice] or
    /// [`Error::PageTableUnavailable`][crate::Error::PageTableUnavailable].
    ///
    /// Calling this more than once is a no-op. Dropping the last reference to an address space
    /// calls it implicitly.
    ///
    /// # Panics
    ///
    /// Panics if anything registered survived teardown, or a context removed by another thread was
    /// never destroyed.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let driver = self.global.driver();
        log::debug!("tearing down address space {}", self.id);

        // nobody can find us anymore
        self.global.unregister_address_space(self.id);

        {
            let state = self.state.read();
            self.channels_stopped.store(true, Ordering::Release);
            for context in state.device_vas.iter().flatten() {
                context.channels().stop_all();
            }
        }

        let mut deferred = DeferredFreeList::new();
        let mut bridged = PeerPairSet::new();
        let retained: Vec<Arc<Device>>;
        {
            let mut state = self.state.write();
            state.disallow_new_registers = true;

            retained = state.devices.iter().flatten().cloned().collect();

            for context in state.device_vas.iter().flatten() {
                for channel in context.channels().detach_all() {
                    deferred.push_channel(channel, context.device().clone());
                }
            }

            for range in mem::take(&mut state.ranges) {
                range.destroy(&mut deferred);
            }

            for device in &retained {
                for (a, b) in state.unregister_device(device.id(), &mut deferred).iter() {
                    bridged.insert(a, b);
                }
            }

            assert!(state.registered_devices.is_empty());
            assert!(state.enabled_peers.is_empty());
            assert_eq!(state.registered_device_vas, ProcessorMask::new());
        }

        // background work may still reference our contexts
        self.global.deferred_work().flush();
        for device in &retained {
            device.flush_fault_handling();
        }

        // contexts other threads removed but have not destroyed yet
        let own = deferred.device_va_count();
        log::trace!(
            "waiting for {} foreign context destructions",
            self.pending.count().saturating_sub(own)
        );
        self.pending.wait_until_at_most(own);

        deferred.drain(driver);
        assert_eq!(
            self.pending.count(),
            0,
            "contexts of address space {} outlived teardown",
            self.id
        );

        let mut global = self.global.lock();
        for (a, b) in bridged.iter() {
            global.topology.release_peer_access(driver, a, b);
        }
        for device in &retained {
            global.topology.release(device.id());
        }
        drop(global);

        log::debug!("address space {} torn down", self.id);
    }
}
