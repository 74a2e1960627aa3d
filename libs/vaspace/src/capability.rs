// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pairwise processor capabilities of a single address space.
//!
//! Every capability is stored as an adjacency matrix over [`ProcessorId`]s where row `x` holds the
//! processors `x` has the capability towards. Edges between two devices are always stored in both
//! directions, edges involving the host processor are directional.

use core::fmt;

use bitflags::bitflags;

use crate::processor::{MAX_PROCESSORS, ProcessorId, ProcessorMask};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Capability {
    /// `x` can map and access memory resident on `y`.
    CanAccess,
    /// Memory resident on `x` can be accessed by `y`. Always the transpose of
    /// [`Capability::CanAccess`].
    AccessibleFrom,
    /// `x`'s copy engines can copy from memory resident on `y`.
    CanCopyFrom,
    /// `x` and `y` share a direct interconnect link.
    DirectLink,
    /// The direct link between `x` and `y` routes through host memory.
    IndirectLink,
    /// `x` can perform atomics natively on memory resident on `y`.
    NativeAtomics,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::CanAccess,
        Capability::AccessibleFrom,
        Capability::CanCopyFrom,
        Capability::DirectLink,
        Capability::IndirectLink,
        Capability::NativeAtomics,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// A set of [`Capability`]s granted in one go.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct CapabilitySet: u8 {
        const CAN_ACCESS = 1 << 0;
        const ACCESSIBLE_FROM = 1 << 1;
        const CAN_COPY_FROM = 1 << 2;
        const DIRECT_LINK = 1 << 3;
        const INDIRECT_LINK = 1 << 4;
        const NATIVE_ATOMICS = 1 << 5;
    }
}

impl CapabilitySet {
    pub fn capabilities(self) -> impl Iterator<Item = Capability> {
        Capability::ALL
            .into_iter()
            .filter(move |cap| self.contains(Self::from(*cap)))
    }
}

impl From<Capability> for CapabilitySet {
    fn from(value: Capability) -> Self {
        match value {
            Capability::CanAccess => CapabilitySet::CAN_ACCESS,
            Capability::AccessibleFrom => CapabilitySet::ACCESSIBLE_FROM,
            Capability::CanCopyFrom => CapabilitySet::CAN_COPY_FROM,
            Capability::DirectLink => CapabilitySet::DIRECT_LINK,
            Capability::IndirectLink => CapabilitySet::INDIRECT_LINK,
            Capability::NativeAtomics => CapabilitySet::NATIVE_ATOMICS,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
struct CapabilityMatrix {
    rows: [ProcessorMask; MAX_PROCESSORS],
}

impl CapabilityMatrix {
    const fn new() -> Self {
        Self {
            rows: [ProcessorMask::new(); MAX_PROCESSORS],
        }
    }

    fn set(&mut self, from: ProcessorId, to: ProcessorId) {
        self.rows[from.get()].set(to);
    }

    fn clear(&mut self, from: ProcessorId, to: ProcessorId) {
        self.rows[from.get()].clear(to);
    }

    fn test(&self, from: ProcessorId, to: ProcessorId) -> bool {
        self.rows[from.get()].test(to)
    }
}

/// The six capability matrices of an address space.
#[derive(Clone, Eq, PartialEq)]
pub struct PeerCapabilities {
    matrices: [CapabilityMatrix; Capability::ALL.len()],
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PeerCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PeerCapabilities");
        for cap in Capability::ALL {
            let matrix = &self.matrices[cap.index()];
            let rows: alloc::vec::Vec<_> = matrix
                .rows
                .iter()
                .enumerate()
                .filter(|(_, row)| !row.is_empty())
                .map(|(from, row)| (ProcessorId::from_index(from), *row))
                .collect();
            s.field(&alloc::format!("{cap:?}"), &rows);
        }
        s.finish()
    }
}

impl PeerCapabilities {
    /// Creates the capability matrices of a fresh address space.
    ///
    /// Only the host processor's self bits are set.
    pub fn new() -> Self {
        let mut this = Self {
            matrices: [CapabilityMatrix::new(); Capability::ALL.len()],
        };
        this.set_self(
            ProcessorId::HOST,
            CapabilitySet::CAN_ACCESS
                | CapabilitySet::ACCESSIBLE_FROM
                | CapabilitySet::CAN_COPY_FROM
                | CapabilitySet::NATIVE_ATOMICS,
        );
        this
    }

    pub fn test(&self, cap: Capability, from: ProcessorId, to: ProcessorId) -> bool {
        self.matrices[cap.index()].test(from, to)
    }

    /// Returns every processor `from` holds `cap` towards.
    pub fn row(&self, cap: Capability, from: ProcessorId) -> ProcessorMask {
        self.matrices[cap.index()].rows[from.get()]
    }

    /// Sets `caps` on the diagonal entry of `id`.
    pub fn set_self(&mut self, id: ProcessorId, caps: CapabilitySet) {
        for cap in caps.capabilities() {
            self.matrices[cap.index()].set(id, id);
        }
    }

    /// Sets `caps` between two distinct devices, in both directions.
    pub fn set_pair(&mut self, a: ProcessorId, b: ProcessorId, caps: CapabilitySet) {
        debug_assert!(a.is_device() && b.is_device() && a != b);
        for cap in caps.capabilities() {
            let matrix = &mut self.matrices[cap.index()];
            matrix.set(a, b);
            matrix.set(b, a);
        }
    }

    /// Clears `caps` between two distinct devices, in both directions.
    pub fn clear_pair(&mut self, a: ProcessorId, b: ProcessorId, caps: CapabilitySet) {
        debug_assert!(a.is_device() && b.is_device() && a != b);
        for cap in caps.capabilities() {
            let matrix = &mut self.matrices[cap.index()];
            matrix.clear(a, b);
            matrix.clear(b, a);
        }
    }

    /// Sets `caps` on the single directed edge `from -> to` where one end is the host processor.
    pub fn grant_edge(&mut self, from: ProcessorId, to: ProcessorId, caps: CapabilitySet) {
        debug_assert!(from.is_host() != to.is_host());
        for cap in caps.capabilities() {
            self.matrices[cap.index()].set(from, to);
        }
    }

    /// Records that `from` can access memory resident on `to`, keeping `AccessibleFrom` its
    /// transpose.
    pub fn grant_access(&mut self, from: ProcessorId, to: ProcessorId) {
        self.matrices[Capability::CanAccess.index()].set(from, to);
        self.matrices[Capability::AccessibleFrom.index()].set(to, from);
    }

    /// Removes every capability edge touching `id`, including its diagonal.
    ///
    /// # Panics
    ///
    /// Panics if `id` is the host processor.
    pub fn clear_processor(&mut self, id: ProcessorId) {
        assert!(id.is_device(), "host capabilities are never cleared");
        for matrix in &mut self.matrices {
            matrix.rows[id.get()] = ProcessorMask::new();
            for row in &mut matrix.rows {
                row.clear(id);
            }
        }
    }

    /// Returns `true` if no capability references `id`.
    pub fn is_clear(&self, id: ProcessorId) -> bool {
        self.matrices.iter().all(|matrix| {
            matrix.rows[id.get()].is_empty() && matrix.rows.iter().all(|row| !row.test(id))
        })
    }

    /// Checks the structural invariants of the matrices, given the set of registered `devices`.
    ///
    /// # Panics
    ///
    /// Panics if an invariant is broken.
    pub fn assert_consistent(&self, devices: ProcessorMask) {
        for cap in [
            Capability::CanAccess,
            Capability::AccessibleFrom,
            Capability::CanCopyFrom,
            Capability::NativeAtomics,
        ] {
            assert!(
                self.test(cap, ProcessorId::HOST, ProcessorId::HOST),
                "host self bit for {cap:?} is missing"
            );
        }

        for x in 0..MAX_PROCESSORS {
            let x = ProcessorId::from_index(x);
            for y in 0..MAX_PROCESSORS {
                let y = ProcessorId::from_index(y);

                assert_eq!(
                    self.test(Capability::CanAccess, x, y),
                    self.test(Capability::AccessibleFrom, y, x),
                    "can_access[{x:?}][{y:?}] is not the transpose of accessible_from"
                );

                if x.is_device() && y.is_device() && x != y {
                    for cap in Capability::ALL {
                        assert_eq!(
                            self.test(cap, x, y),
                            self.test(cap, y, x),
                            "{cap:?} is not symmetric between {x:?} and {y:?}"
                        );
                    }
                }

                if self.test(Capability::DirectLink, x, y) && x.is_device() && y.is_device() {
                    assert!(
                        self.test(Capability::CanAccess, x, y),
                        "direct link between {x:?} and {y:?} without access"
                    );
                }
            }

            if x.is_device() && !devices.test(x) {
                assert!(self.is_clear(x), "unregistered {x:?} still has capabilities");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(n: usize) -> ProcessorId {
        ProcessorId::device(n).unwrap()
    }

    #[test]
    fn fresh_matrices_only_have_host_self_bits() {
        let caps = PeerCapabilities::new();
        caps.assert_consistent(ProcessorMask::new());

        assert!(caps.test(Capability::CanAccess, ProcessorId::HOST, ProcessorId::HOST));
        assert!(!caps.test(Capability::DirectLink, ProcessorId::HOST, ProcessorId::HOST));
        assert!(caps.row(Capability::CanAccess, dev(1)).is_empty());
    }

    #[test]
    fn pairs_are_symmetric() {
        let mut caps = PeerCapabilities::new();
        let all_pair = CapabilitySet::CAN_ACCESS
            | CapabilitySet::ACCESSIBLE_FROM
            | CapabilitySet::DIRECT_LINK;

        caps.set_pair(dev(1), dev(2), all_pair);
        assert!(caps.test(Capability::DirectLink, dev(2), dev(1)));
        assert!(caps.test(Capability::CanAccess, dev(1), dev(2)));
        caps.assert_consistent(ProcessorMask::from_ids([dev(1), dev(2)]));

        caps.clear_pair(dev(2), dev(1), all_pair);
        assert!(!caps.test(Capability::DirectLink, dev(1), dev(2)));
        assert!(!caps.test(Capability::CanAccess, dev(2), dev(1)));
    }

    #[test]
    fn host_edges_are_directional() {
        let mut caps = PeerCapabilities::new();
        caps.grant_access(dev(3), ProcessorId::HOST);
        caps.grant_edge(dev(3), ProcessorId::HOST, CapabilitySet::NATIVE_ATOMICS);

        assert!(caps.test(Capability::CanAccess, dev(3), ProcessorId::HOST));
        assert!(caps.test(Capability::AccessibleFrom, ProcessorId::HOST, dev(3)));
        assert!(!caps.test(Capability::CanAccess, ProcessorId::HOST, dev(3)));
        assert!(caps.test(Capability::NativeAtomics, dev(3), ProcessorId::HOST));
        assert!(!caps.test(Capability::NativeAtomics, ProcessorId::HOST, dev(3)));
        caps.assert_consistent(ProcessorMask::from_ids([dev(3)]));
    }

    #[test]
    fn clear_processor_removes_rows_and_columns() {
        let mut caps = PeerCapabilities::new();
        let registered = ProcessorMask::from_ids([dev(1), dev(2)]);
        for id in registered {
            caps.set_self(id, CapabilitySet::CAN_ACCESS | CapabilitySet::ACCESSIBLE_FROM);
            caps.grant_access(id, ProcessorId::HOST);
            caps.grant_access(ProcessorId::HOST, id);
        }
        caps.set_pair(
            dev(1),
            dev(2),
            CapabilitySet::CAN_ACCESS | CapabilitySet::ACCESSIBLE_FROM,
        );
        caps.assert_consistent(registered);

        caps.clear_processor(dev(2));
        assert!(caps.is_clear(dev(2)));
        assert!(!caps.is_clear(dev(1)));
        caps.assert_consistent(ProcessorMask::from_ids([dev(1)]));
    }

    #[test]
    #[should_panic(expected = "transpose")]
    fn broken_transpose_is_detected() {
        let mut caps = PeerCapabilities::new();
        caps.grant_edge(dev(1), ProcessorId::HOST, CapabilitySet::CAN_ACCESS);
        caps.assert_consistent(ProcessorMask::from_ids([dev(1)]));
    }

    #[test]
    fn capability_set_iterates_in_order() {
        let set = CapabilitySet::NATIVE_ATOMICS | CapabilitySet::CAN_ACCESS;
        assert_eq!(
            set.capabilities().collect::<Vec<_>>(),
            vec![Capability::CanAccess, Capability::NativeAtomics]
        );
    }
}
