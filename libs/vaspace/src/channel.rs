// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::lock::{LockRank, RankedMutex};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Aperture {
    Sysmem,
    Vidmem,
}

/// Location of a channel's instance block, which uniquely identifies the channel on its device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct InstancePtr {
    pub address: u64,
    pub aperture: Aperture,
}

/// A host command channel bound to a device VA context.
pub trait Channel: Send + Sync {
    fn instance_ptr(&self) -> InstancePtr;

    /// Stops the channel from executing further work. Must be idempotent.
    fn stop(&self);

    /// Frees the channel's resources once it is detached from every lookup structure.
    fn destroy_detached(&self);
}

/// The channels registered on one device VA context.
pub struct ChannelRegistry {
    channels: RankedMutex<Vec<Arc<dyn Channel>>>,
    disallow_new: AtomicBool,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channels.lock().len())
            .field("disallow_new", &self.disallow_new.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: RankedMutex::new(LockRank::DeviceVa, Vec::new()),
            disallow_new: AtomicBool::new(false),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidDevice`] once the registry stopped accepting channels.
    pub fn register(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let mut channels = self.channels.lock();
        if self.disallow_new.load(Ordering::Acquire) {
            return Err(Error::InvalidDevice);
        }
        channels.try_reserve(1)?;
        channels.push(channel);
        Ok(())
    }

    /// Stops every registered channel and refuses new registrations from now on.
    pub fn stop_all(&self) {
        let channels = {
            let channels = self.channels.lock();
            self.disallow_new.store(true, Ordering::Release);
            channels.clone()
        };

        log::trace!("stopping {} channels", channels.len());
        for channel in &channels {
            channel.stop();
        }
    }

    pub fn accepts_new(&self) -> bool {
        !self.disallow_new.load(Ordering::Acquire)
    }

    /// Unlinks every channel and hands them to the caller for deferred destruction.
    pub fn detach_all(&self) -> Vec<Arc<dyn Channel>> {
        let mut channels = self.channels.lock();
        self.disallow_new.store(true, Ordering::Release);
        core::mem::take(&mut *channels)
    }

    pub fn find(&self, instance_ptr: InstancePtr) -> Option<Arc<dyn Channel>> {
        self.channels
            .lock()
            .iter()
            .find(|channel| channel.instance_ptr() == instance_ptr)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChannel;

    #[test]
    fn stop_all_disallows_new_channels() {
        let registry = ChannelRegistry::new();
        let a = Arc::new(MockChannel::new(0x1000));
        let b = Arc::new(MockChannel::new(0x2000));
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        registry.stop_all();
        assert!(a.is_stopped() && b.is_stopped());
        assert!(!registry.accepts_new());
        assert_eq!(
            registry.register(Arc::new(MockChannel::new(0x3000))).unwrap_err(),
            Error::InvalidDevice
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn find_by_instance_ptr() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(MockChannel::new(0x1000))).unwrap();
        registry.register(Arc::new(MockChannel::new(0x2000))).unwrap();

        let found = registry.find(MockChannel::instance_ptr_for(0x2000)).unwrap();
        assert_eq!(found.instance_ptr().address, 0x2000);
        assert!(registry.find(MockChannel::instance_ptr_for(0x4000)).is_none());
    }

    #[test]
    fn detach_all_empties_the_registry() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(MockChannel::new(0x1000))).unwrap();

        let detached = registry.detach_all();
        assert_eq!(detached.len(), 1);
        assert!(registry.is_empty());
        assert!(!registry.accepts_new());
    }
}
