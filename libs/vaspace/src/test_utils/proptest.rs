// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `proptest` strategies for address space operation sequences

use std::ops::Range;

use proptest::prelude::{Strategy, prop_oneof};

/// One public address space operation. Devices are given as indices into the test system's
/// device list.
#[derive(Debug, Clone, Copy)]
pub enum Op {
    RegisterDevice(usize),
    UnregisterDevice(usize),
    RegisterDeviceVa(usize),
    UnregisterDeviceVa(usize),
    EnablePeers(usize, usize),
    DisablePeers(usize, usize),
    RegisterChannel(usize),
}

/// Produces a single [`Op`] on one of `num_devices` devices
pub fn op(num_devices: usize) -> impl Strategy<Value = Op> {
    let dev = 0..num_devices;
    prop_oneof![
        3 => dev.clone().prop_map(Op::RegisterDevice),
        1 => dev.clone().prop_map(Op::UnregisterDevice),
        2 => dev.clone().prop_map(Op::RegisterDeviceVa),
        1 => dev.clone().prop_map(Op::UnregisterDeviceVa),
        2 => (dev.clone(), dev.clone()).prop_map(|(a, b)| Op::EnablePeers(a, b)),
        1 => (dev.clone(), dev.clone()).prop_map(|(a, b)| Op::DisablePeers(a, b)),
        1 => dev.prop_map(Op::RegisterChannel),
    ]
}

/// Produces a sequence of [`Op`]s whose length lies in `len`
pub fn ops(num_devices: usize, len: Range<usize>) -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(op(num_devices), len)
}
