// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;

use crate::Result;
use crate::deferred::DeferredFreeList;
use crate::device_va::DeviceVaContext;
use crate::processor::ProcessorId;

/// A managed memory range living in an address space.
///
/// Ranges are notified of every topology change while the address space lock is held exclusively.
/// Anything a range wants to free in response goes onto the provided [`DeferredFreeList`], which is
/// drained after the lock is released.
pub trait MemoryRange: Send + Sync {
    /// Unmaps everything from `device` and drops any state tied to it.
    fn on_device_unregistered(&mut self, device: ProcessorId, deferred: &mut DeferredFreeList);

    /// `a` and `b` just became peers.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot establish peer mappings. The peer pair is torn down
    /// again afterwards, including a call to [`MemoryRange::on_peer_disabled`] for this range.
    fn on_peer_enabled(&mut self, a: ProcessorId, b: ProcessorId) -> Result<()>;

    fn on_peer_disabled(&mut self, a: ProcessorId, b: ProcessorId, deferred: &mut DeferredFreeList);

    /// A device VA context became active.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot be made available in the new context. The context is
    /// removed again afterwards, including a call to [`MemoryRange::on_device_va_removed`].
    fn on_device_va_added(&mut self, context: &DeviceVaContext) -> Result<()>;

    fn on_device_va_removed(&mut self, context: &DeviceVaContext, deferred: &mut DeferredFreeList);

    /// Destroys the range during address space teardown.
    fn destroy(self: Box<Self>, deferred: &mut DeferredFreeList);
}

/// A mapping of memory owned outside of the address space, freed through deferred destruction.
pub trait ExternalMapping: Send {
    fn free(self: Box<Self>);
}
