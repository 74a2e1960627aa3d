// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Locks that know their place in the lock hierarchy.
//!
//! Every lock carries a [`LockRank`]. In debug builds each thread records the ranks it currently
//! holds and acquiring a lock whose rank is not strictly greater than the most recently acquired
//! one panics instead of (potentially) deadlocking. Release builds compile the bookkeeping away.
//!
//! The two highest ranks belong to locks this crate never takes itself: a device's ATS lock and
//! the host process' address space lock. Collaborators that hold them from inside range or channel
//! callbacks wrap them in [`RankedMutex`]/[`RankedRwLock`] with those ranks so their ordering is
//! checked together with ours.

use core::fmt;
use core::ops::{Deref, DerefMut};

use lock_api::{RawMutex, RawRwLock, RawRwLockDowngrade};

/// Position of a lock in the global lock order. Locks must be acquired in increasing rank order.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum LockRank {
    /// The global device/topology/registry lock.
    Global,
    /// An address space's reader/writer lock.
    AddressSpace,
    /// A device VA context's channel registry.
    DeviceVa,
    /// The per-device address translation service lock shared by a device's VA contexts.
    Ats,
    /// The host process' own address space lock.
    HostMm,
}

#[cfg(debug_assertions)]
std::thread_local! {
    static HELD_RANKS: core::cell::RefCell<alloc::vec::Vec<LockRank>> =
        const { core::cell::RefCell::new(alloc::vec::Vec::new()) };
}

/// Proof that the current thread is allowed to hold a lock of `rank`.
struct RankToken {
    #[cfg_attr(not(debug_assertions), expect(dead_code, reason = "only tracked in debug builds"))]
    rank: LockRank,
}

impl RankToken {
    fn acquire(rank: LockRank) -> Self {
        #[cfg(debug_assertions)]
        HELD_RANKS.with_borrow_mut(|held| {
            if let Some(top) = held.last() {
                assert!(
                    *top < rank,
                    "lock order violation: acquiring {rank:?} while holding {top:?}"
                );
            }
            held.push(rank);
        });

        Self { rank }
    }
}

impl Drop for RankToken {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD_RANKS.with_borrow_mut(|held| {
            // guards may be released out of acquisition order
            if let Some(pos) = held.iter().rposition(|rank| *rank == self.rank) {
                held.remove(pos);
            }
        });
    }
}

/// Returns `true` if the calling thread currently holds a lock of `rank`.
///
/// Always returns `false` in release builds.
pub fn holds_rank(rank: LockRank) -> bool {
    #[cfg(debug_assertions)]
    {
        HELD_RANKS.with_borrow(|held| held.contains(&rank))
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = rank;
        false
    }
}

// =============================================================================
// RwLock
// =============================================================================

pub struct RankedRwLock<T, R: RawRwLock = parking_lot::RawRwLock> {
    rank: LockRank,
    inner: lock_api::RwLock<R, T>,
}

impl<T: fmt::Debug, R: RawRwLock> fmt::Debug for RankedRwLock<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedRwLock")
            .field("rank", &self.rank)
            .field("inner", &self.inner)
            .finish()
    }
}

impl<T> RankedRwLock<T> {
    pub fn new(rank: LockRank, value: T) -> Self {
        Self::with_raw(rank, value)
    }
}

impl<T, R: RawRwLock> RankedRwLock<T, R> {
    /// Like [`RankedRwLock::new`] but backed by a raw lock other than `parking_lot`'s.
    pub fn with_raw(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: lock_api::RwLock::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    /// Whether a writer holds the lock, or has claimed it and is waiting for readers to leave.
    pub fn is_locked_exclusive(&self) -> bool {
        self.inner.is_locked_exclusive()
    }

    pub fn read(&self) -> RankedReadGuard<'_, T, R> {
        let token = RankToken::acquire(self.rank);
        RankedReadGuard {
            guard: self.inner.read(),
            _token: token,
        }
    }

    pub fn write(&self) -> RankedWriteGuard<'_, T, R> {
        let token = RankToken::acquire(self.rank);
        RankedWriteGuard {
            guard: self.inner.write(),
            token,
        }
    }
}

pub struct RankedReadGuard<'a, T, R: RawRwLock = parking_lot::RawRwLock> {
    guard: lock_api::RwLockReadGuard<'a, R, T>,
    _token: RankToken,
}

impl<T, R: RawRwLock> Deref for RankedReadGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

pub struct RankedWriteGuard<'a, T, R: RawRwLock = parking_lot::RawRwLock> {
    guard: lock_api::RwLockWriteGuard<'a, R, T>,
    token: RankToken,
}

impl<'a, T, R: RawRwLockDowngrade> RankedWriteGuard<'a, T, R> {
    /// Atomically turns exclusive access into shared access without letting a writer in between.
    pub fn downgrade(self) -> RankedReadGuard<'a, T, R> {
        let Self { guard, token } = self;
        RankedReadGuard {
            guard: lock_api::RwLockWriteGuard::downgrade(guard),
            _token: token,
        }
    }
}

impl<T, R: RawRwLock> Deref for RankedWriteGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T, R: RawRwLock> DerefMut for RankedWriteGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

// =============================================================================
// Mutex
// =============================================================================

pub struct RankedMutex<T, R: RawMutex = parking_lot::RawMutex> {
    rank: LockRank,
    inner: lock_api::Mutex<R, T>,
}

impl<T: fmt::Debug, R: RawMutex> fmt::Debug for RankedMutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedMutex")
            .field("rank", &self.rank)
            .field("inner", &self.inner)
            .finish()
    }
}

impl<T> RankedMutex<T> {
    pub fn new(rank: LockRank, value: T) -> Self {
        Self::with_raw(rank, value)
    }
}

impl<T, R: RawMutex> RankedMutex<T, R> {
    /// Like [`RankedMutex::new`] but backed by a raw lock other than `parking_lot`'s.
    pub fn with_raw(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: lock_api::Mutex::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    pub fn lock(&self) -> RankedMutexGuard<'_, T, R> {
        let token = RankToken::acquire(self.rank);
        RankedMutexGuard {
            guard: self.inner.lock(),
            _token: token,
        }
    }
}

pub struct RankedMutexGuard<'a, T, R: RawMutex = parking_lot::RawMutex> {
    guard: lock_api::MutexGuard<'a, R, T>,
    _token: RankToken,
}

impl<T, R: RawMutex> Deref for RankedMutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T, R: RawMutex> DerefMut for RankedMutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
