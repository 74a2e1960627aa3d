// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Coordination of one process's address space across the host processor and a set of attached
//! devices.
//!
//! A [`Global`] owns the attached devices and their pairwise interconnect topology. Each process
//! gets an [`AddressSpace`] from it, with which devices are registered, per-device VA contexts are
//! created and device pairs are made peers of each other. All of this may happen concurrently from
//! any number of threads.

extern crate alloc;

mod address_space;
mod affinity;
mod capability;
mod channel;
mod config;
mod deferred;
mod device_va;
mod driver;
mod error;
mod global;
mod lock;
mod page_tree;
mod processor;
mod range;
mod topology;
mod work_queue;

#[cfg(test)]
mod test_utils;

pub type Result<T> = core::result::Result<T, Error>;

pub use address_space::AddressSpace;
pub use affinity::{AffinityEntry, AffinityTable, MAX_NUMA_NODES};
pub use capability::{Capability, CapabilitySet, PeerCapabilities};
pub use channel::{Aperture, Channel, ChannelRegistry, InstancePtr};
pub use config::Config;
pub use deferred::{DeferredFree, DeferredFreeList};
pub use device_va::{DeviceVaContext, DeviceVaState, PendingDestructions};
pub use driver::{
    BIG_PAGE_SIZE_64K, BIG_PAGE_SIZE_128K, Driver, DupedAddressSpace, DupedHandle,
    ExternalVaHandle,
};
pub use error::Error;
pub use global::Global;
pub use lock::{
    LockRank, RankedMutex, RankedMutexGuard, RankedReadGuard, RankedRwLock, RankedWriteGuard,
    holds_rank,
};
pub use page_tree::PageTree;
pub use processor::{
    MAX_DEVICES, MAX_PEER_PAIRS, MAX_PROCESSORS, PeerPairSet, ProcessorId, ProcessorMask,
    peer_pair_index,
};
pub use range::{ExternalMapping, MemoryRange};
pub use topology::{Device, DeviceInfo, LinkClass, PeerLink};
pub use work_queue::WorkQueue;
