// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::string::String;

/// Process-independent settings shared by every address space of a [`Global`][crate::Global].
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether device VA contexts that rely on address-translation-services may be registered.
    pub ats_supported: bool,
    /// Prefix for the names of the background worker threads.
    pub worker_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ats_supported: false,
            worker_name_prefix: String::from("vaspace"),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ats_supported(mut self, ats_supported: bool) -> Self {
        self.ats_supported = ats_supported;
        self
    }

    #[must_use]
    pub fn with_worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }
}
