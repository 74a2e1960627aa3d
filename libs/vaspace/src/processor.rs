// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use static_assertions::const_assert;

/// The maximum number of devices that can be attached at the same time.
pub const MAX_DEVICES: usize = 32;
/// The host processor plus every device.
pub const MAX_PROCESSORS: usize = MAX_DEVICES + 1;
/// Number of distinct unordered device pairs.
pub const MAX_PEER_PAIRS: usize = MAX_DEVICES * (MAX_DEVICES - 1) / 2;

const MASK_WORDS: usize = MAX_PROCESSORS.div_ceil(u64::BITS as usize);
const PAIR_WORDS: usize = MAX_PEER_PAIRS.div_ceil(u64::BITS as usize);

const_assert!(MAX_PROCESSORS <= u8::MAX as usize);
const_assert!(MASK_WORDS * 64 >= MAX_PROCESSORS);
const_assert!(PAIR_WORDS * 64 >= MAX_PEER_PAIRS);

/// Identifies either the host processor (always id `0`) or one attached device (`1..=MAX_DEVICES`).
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessorId(u8);

impl ProcessorId {
    pub const HOST: Self = Self(0);

    /// Returns the id of the `index`th device (1-based), or `None` if it is out of range.
    pub const fn device(index: usize) -> Option<Self> {
        if index == 0 || index > MAX_DEVICES {
            None
        } else {
            Some(Self::from_index(index))
        }
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "index is bounded by MAX_PROCESSORS which fits u8"
    )]
    pub(crate) const fn from_index(index: usize) -> Self {
        debug_assert!(index < MAX_PROCESSORS);
        Self(index as u8)
    }

    pub const fn get(self) -> usize {
        self.0 as usize
    }

    pub const fn is_host(self) -> bool {
        self.0 == 0
    }

    pub const fn is_device(self) -> bool {
        !self.is_host()
    }
}

impl fmt::Debug for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            f.write_str("[host]")
        } else {
            write!(f, "[device #{}]", self.0)
        }
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            f.write_str("host")
        } else {
            write!(f, "device#{}", self.0)
        }
    }
}

/// Fixed-size set of [`ProcessorId`]s.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct ProcessorMask {
    bits: [u64; MASK_WORDS],
}

impl ProcessorMask {
    pub const fn new() -> Self {
        Self {
            bits: [0; MASK_WORDS],
        }
    }

    pub fn from_ids(ids: impl IntoIterator<Item = ProcessorId>) -> Self {
        let mut mask = Self::new();
        for id in ids {
            mask.set(id);
        }
        mask
    }

    #[inline]
    pub fn set(&mut self, id: ProcessorId) {
        self.bits[id.get() / 64] |= 1 << (id.get() % 64);
    }

    #[inline]
    pub fn clear(&mut self, id: ProcessorId) {
        self.bits[id.get() / 64] &= !(1 << (id.get() % 64));
    }

    #[inline]
    pub fn test(self, id: ProcessorId) -> bool {
        self.bits[id.get() / 64] & (1 << (id.get() % 64)) != 0
    }

    pub fn is_empty(self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    pub fn count(self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        let mut out = self;
        for (a, b) in out.bits.iter_mut().zip(other.bits) {
            *a &= b;
        }
        out
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        let mut out = self;
        for (a, b) in out.bits.iter_mut().zip(other.bits) {
            *a |= b;
        }
        out
    }

    /// Returns the ids contained in `self` but not in `other`.
    #[must_use]
    pub fn and_not(self, other: Self) -> Self {
        let mut out = self;
        for (a, b) in out.bits.iter_mut().zip(other.bits) {
            *a &= !b;
        }
        out
    }

    /// Returns a copy of this mask with the host bit removed.
    #[must_use]
    pub fn devices(self) -> Self {
        let mut out = self;
        out.clear(ProcessorId::HOST);
        out
    }

    pub fn first(self) -> Option<ProcessorId> {
        self.iter().next()
    }

    pub fn iter(self) -> Iter {
        Iter {
            mask: self,
            next: 0,
        }
    }
}

impl fmt::Debug for ProcessorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl IntoIterator for ProcessorMask {
    type Item = ProcessorId;
    type IntoIter = Iter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<ProcessorId> for ProcessorMask {
    fn from_iter<T: IntoIterator<Item = ProcessorId>>(iter: T) -> Self {
        Self::from_ids(iter)
    }
}

/// Iterator over the ids in a [`ProcessorMask`], lowest id first.
pub struct Iter {
    mask: ProcessorMask,
    next: usize,
}

impl Iterator for Iter {
    type Item = ProcessorId;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < MAX_PROCESSORS {
            let id = ProcessorId::from_index(self.next);
            self.next += 1;
            if self.mask.test(id) {
                return Some(id);
            }
        }
        None
    }
}

/// Maps an unordered pair of *distinct devices* to a dense index in `0..MAX_PEER_PAIRS`.
///
/// # Panics
///
/// Panics if either id is the host or both ids are the same.
pub fn peer_pair_index(a: ProcessorId, b: ProcessorId) -> usize {
    assert!(
        a.is_device() && b.is_device() && a != b,
        "peer pairs are made of two distinct devices ({a:?}, {b:?})"
    );

    // zero based device indices, lo < hi
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let (lo, hi) = (lo.get() - 1, hi.get() - 1);

    // row-major upper triangle without the diagonal
    lo * (2 * MAX_DEVICES - lo - 1) / 2 + (hi - lo - 1)
}

/// Set of unordered device pairs.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct PeerPairSet {
    bits: [u64; PAIR_WORDS],
}

impl PeerPairSet {
    pub const fn new() -> Self {
        Self {
            bits: [0; PAIR_WORDS],
        }
    }

    pub fn insert(&mut self, a: ProcessorId, b: ProcessorId) {
        let index = peer_pair_index(a, b);
        self.bits[index / 64] |= 1 << (index % 64);
    }

    pub fn remove(&mut self, a: ProcessorId, b: ProcessorId) {
        let index = peer_pair_index(a, b);
        self.bits[index / 64] &= !(1 << (index % 64));
    }

    pub fn contains(&self, a: ProcessorId, b: ProcessorId) -> bool {
        let index = peer_pair_index(a, b);
        self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Iterates over every pair in the set as `(lower id, higher id)`.
    pub fn iter(&self) -> impl Iterator<Item = (ProcessorId, ProcessorId)> + '_ {
        (1..=MAX_DEVICES).flat_map(move |lo| {
            ((lo + 1)..=MAX_DEVICES).filter_map(move |hi| {
                let (a, b) = (ProcessorId::from_index(lo), ProcessorId::from_index(hi));
                self.contains(a, b).then_some((a, b))
            })
        })
    }
}

impl fmt::Debug for PeerPairSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn dev(n: usize) -> ProcessorId {
        ProcessorId::device(n).unwrap()
    }

    #[test]
    fn device_ids_are_bounded() {
        assert!(ProcessorId::device(0).is_none());
        assert!(ProcessorId::device(MAX_DEVICES + 1).is_none());
        assert_eq!(ProcessorId::device(MAX_DEVICES).unwrap().get(), MAX_DEVICES);
        assert!(ProcessorId::HOST.is_host());
        assert!(dev(1).is_device());
    }

    #[test]
    fn mask_basics() {
        let mut mask = ProcessorMask::new();
        assert!(mask.is_empty());

        mask.set(ProcessorId::HOST);
        mask.set(dev(3));
        mask.set(dev(MAX_DEVICES));

        assert_eq!(mask.count(), 3);
        assert!(mask.test(dev(3)));
        assert!(!mask.test(dev(2)));
        assert_eq!(
            mask.iter().collect::<Vec<_>>(),
            vec![ProcessorId::HOST, dev(3), dev(MAX_DEVICES)]
        );
        assert_eq!(mask.devices().first(), Some(dev(3)));

        mask.clear(dev(3));
        assert!(!mask.test(dev(3)));
    }

    #[test]
    fn mask_set_operations() {
        let a = ProcessorMask::from_ids([dev(1), dev(2), dev(3)]);
        let b = ProcessorMask::from_ids([dev(2), dev(4)]);

        assert_eq!(a.and(b), ProcessorMask::from_ids([dev(2)]));
        assert_eq!(a.or(b).count(), 4);
        assert_eq!(a.and_not(b), ProcessorMask::from_ids([dev(1), dev(3)]));
    }

    #[test]
    fn pair_index_is_dense_and_unordered() {
        let mut seen = HashSet::new();
        for a in 1..=MAX_DEVICES {
            for b in (a + 1)..=MAX_DEVICES {
                let index = peer_pair_index(dev(a), dev(b));
                assert_eq!(index, peer_pair_index(dev(b), dev(a)));
                assert!(index < MAX_PEER_PAIRS);
                assert!(seen.insert(index), "duplicate index {index}");
            }
        }
        assert_eq!(seen.len(), MAX_PEER_PAIRS);
    }

    #[test]
    #[should_panic]
    fn pair_index_rejects_self_pair() {
        peer_pair_index(dev(2), dev(2));
    }

    #[test]
    fn pair_set() {
        let mut set = PeerPairSet::new();
        set.insert(dev(5), dev(2));
        set.insert(dev(1), dev(MAX_DEVICES));

        assert!(set.contains(dev(2), dev(5)));
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![(dev(1), dev(MAX_DEVICES)), (dev(2), dev(5))]
        );

        set.remove(dev(2), dev(5));
        set.remove(dev(1), dev(MAX_DEVICES));
        assert!(set.is_empty());
    }
}
