// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

use alloc::collections::TryReserveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The device is unknown, not (or already) registered, or a competing operation on it won.
    InvalidDevice,
    /// The flags of a device VA context are not acceptable in this address space.
    ///
    /// Example: mixing ATS and non-ATS contexts.
    InvalidFlags,
    /// Two peer-enabled device VA contexts disagree on their big page size.
    NotCompatible,
    /// The address space is draining and accepts no new registrations.
    PageTableUnavailable,
    /// The system was not able to allocate some resource needed for the operation.
    NoMemory,
    /// The driver refused the request.
    NotSupported,
}

impl From<TryReserveError> for Error {
    fn from(_value: TryReserveError) -> Self {
        Self::NoMemory
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidDevice => f.write_str("the device is not valid for this operation"),
            Error::InvalidFlags => f.write_str(
                "the device VA context flags are not compatible with this address space",
            ),
            Error::NotCompatible => {
                f.write_str("big page sizes of peer-enabled device VA contexts must match")
            }
            Error::PageTableUnavailable => f.write_str("the address space is being torn down"),
            Error::NoMemory => f.write_str("failed to allocate memory"),
            Error::NotSupported => f.write_str("the operation is not supported by the driver"),
        }
    }
}

impl core::error::Error for Error {}
