// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Platform shims.

/// `Instant` that also works in the browser, where `std::time::Instant::now` panics.
pub(crate) mod time {
    #[cfg(not(target_arch = "wasm32"))]
    pub(crate) use std::time::Instant;

    #[cfg(target_arch = "wasm32")]
    pub(crate) use web_time::Instant;
}
