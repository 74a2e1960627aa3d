// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;

use smallvec::SmallVec;

use crate::channel::Channel;
use crate::device_va::DeviceVaContext;
use crate::driver::Driver;
use crate::lock::{LockRank, holds_rank};
use crate::processor::ProcessorMask;
use crate::range::ExternalMapping;
use crate::topology::Device;

/// An object whose destruction had to wait until the address space lock was released.
pub enum DeferredFree {
    Channel {
        channel: Arc<dyn Channel>,
        device: Arc<Device>,
    },
    DeviceVa(Arc<DeviceVaContext>),
    ExternalMapping(Box<dyn ExternalMapping>),
}

impl fmt::Debug for DeferredFree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel { channel, device } => f
                .debug_struct("Channel")
                .field("instance_ptr", &channel.instance_ptr())
                .field("device", &device.id())
                .finish(),
            Self::DeviceVa(context) => f.debug_tuple("DeviceVa").field(context).finish(),
            Self::ExternalMapping(_) => f.write_str("ExternalMapping"),
        }
    }
}

/// Objects collected while the address space lock is held exclusively, destroyed by
/// [`DeferredFreeList::drain`] once it is released.
#[derive(Debug, Default)]
pub struct DeferredFreeList {
    entries: SmallVec<[DeferredFree; 4]>,
}

impl DeferredFreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: DeferredFree) {
        self.entries.push(entry);
    }

    pub fn push_channel(&mut self, channel: Arc<dyn Channel>, device: Arc<Device>) {
        self.push(DeferredFree::Channel { channel, device });
    }

    pub fn push_device_va(&mut self, context: Arc<DeviceVaContext>) {
        self.push(DeferredFree::DeviceVa(context));
    }

    pub fn push_external_mapping(&mut self, mapping: Box<dyn ExternalMapping>) {
        self.push(DeferredFree::ExternalMapping(mapping));
    }

    pub fn append(&mut self, other: &mut Self) {
        self.entries.extend(other.entries.drain(..));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of device VA contexts on the list.
    pub fn device_va_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, DeferredFree::DeviceVa(_)))
            .count()
    }

    /// Destroys every object on the list.
    ///
    /// Before the first channel of a device is destroyed, that device's replayable fault buffer is
    /// flushed so no pending fault still refers to the channel.
    pub fn drain(self, driver: &dyn Driver) {
        debug_assert!(
            !holds_rank(LockRank::AddressSpace),
            "deferred objects drained under an address space lock"
        );

        if self.entries.is_empty() {
            return;
        }
        log::trace!("draining {} deferred objects", self.entries.len());

        let mut flushed = ProcessorMask::new();
        for entry in self.entries {
            match entry {
                DeferredFree::Channel { channel, device } => {
                    if device.info().replayable_faults && !flushed.test(device.id()) {
                        driver.flush_fault_buffer(&device);
                        flushed.set(device.id());
                    }
                    channel.destroy_detached();
                }
                DeferredFree::DeviceVa(context) => context.destroy(driver),
                DeferredFree::ExternalMapping(mapping) => mapping.free(),
            }
        }
    }
}
