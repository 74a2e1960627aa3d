// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use arrayvec::ArrayVec;

use crate::processor::{ProcessorId, ProcessorMask};

/// The maximum number of distinct host NUMA nodes an address space tracks.
pub const MAX_NUMA_NODES: usize = 64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AffinityEntry {
    pub numa_node: u32,
    /// Registered devices whose closest host NUMA node is `numa_node`.
    pub devices: ProcessorMask,
}

/// Groups registered devices by their closest host NUMA node.
///
/// Entries are appended the first time a node is seen and never removed, so an entry's position
/// stays stable for the lifetime of the address space.
#[derive(Debug, Clone, Default)]
pub struct AffinityTable {
    entries: ArrayVec<AffinityEntry, MAX_NUMA_NODES>,
}

impl AffinityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, numa_node: u32, device: ProcessorId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.numa_node == numa_node) {
            entry.devices.set(device);
            return;
        }

        let mut devices = ProcessorMask::new();
        devices.set(device);
        if self
            .entries
            .try_push(AffinityEntry { numa_node, devices })
            .is_err()
        {
            log::warn!("affinity table full, not tracking NUMA node {numa_node} for {device:?}");
        }
    }

    pub fn remove(&mut self, numa_node: u32, device: ProcessorId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.numa_node == numa_node) {
            entry.devices.clear(device);
        }
    }

    pub fn devices_near(&self, numa_node: u32) -> ProcessorMask {
        self.entries
            .iter()
            .find(|e| e.numa_node == numa_node)
            .map(|e| e.devices)
            .unwrap_or_default()
    }

    pub fn entries(&self) -> &[AffinityEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.devices.is_empty())
    }
}
