// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Iterative algorithms built on [`crate::Kernel`].
//!
//! Each algorithm carries its kernels in WGSL and as host shaders, so it runs on WebGPU and on
//! the software backend.  WebGL has no compute stage; running one there fails with
//! [`crate::Error::Unsupported`].

mod page_rank;

pub use page_rank::{Graph, PageRankOptions, PageRankResult, page_rank, page_rank_reference};
