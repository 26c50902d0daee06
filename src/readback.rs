// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Asynchronous GPU to CPU transfers.
//!
//! A readback is the only operation that waits for the GPU.  Starting one captures everything
//! submitted so far; awaiting the returned [`ReadbackFuture`] suspends until the backend
//! reports the data is available.
//!
//! Each resource may have one readback in flight.  Starting a second one before the first
//! future completes (or is dropped) fails immediately with [`Error::ResourceBusy`].
//!
//! ```
//! # use passes_and_kernels::*;
//! # test_executors::spin_on(async {
//! let surface = HeadlessSurface::new(16, 16);
//! let config = SwapChainConfig::default().with_targets(vec![BackendKind::Software]);
//! let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
//! let device = swap_chain.get_device();
//! let data = [1u32, 2, 3, 4];
//! let buffer = device
//!     .create_buffer(&BufferDescriptor::with_data(
//!         bytemuck::cast_slice(&data),
//!         BufferUsage::STORAGE | BufferUsage::COPY_SRC,
//!     ))
//!     .unwrap();
//! let readback = device.create_readback();
//! let result = readback.read_buffer(device, buffer).unwrap().await.unwrap();
//! assert_eq!(result.to_vec::<u32>(), data);
//! device.destroy(buffer).unwrap();
//! # });
//! ```

use crate::device::Device;
use crate::error::Error;
use crate::handles::{BufferHandle, DeviceId, TextureHandle};
use crate::imp::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Issues readbacks against one device.
#[derive(Debug, Clone)]
pub struct Readback {
    device: DeviceId,
}

impl Readback {
    pub(crate) fn new(device: DeviceId) -> Self {
        Readback { device }
    }

    fn check(&self, device: &Device) {
        assert_eq!(
            self.device,
            device.device_id(),
            "readback used with a device that did not create it"
        );
    }

    /// Reads the whole buffer.
    pub fn read_buffer(
        &self,
        device: &mut Device,
        buffer: BufferHandle,
    ) -> Result<ReadbackFuture, Error> {
        self.read_buffer_range(device, buffer, 0, None)
    }

    /// Reads `size` bytes at `offset`, or to the end of the buffer when `size` is `None`.
    pub fn read_buffer_range(
        &self,
        device: &mut Device,
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    ) -> Result<ReadbackFuture, Error> {
        self.check(device);
        let (guard, inner) = device.begin_buffer_readback(buffer, offset, size)?;
        Ok(ReadbackFuture {
            inner: Box::pin(async move {
                let _perf = logwise::perfwarn_begin!("Readback::read_buffer");
                let _guard = guard;
                let bytes = inner.await?;
                Ok(ReadbackData { bytes })
            }),
        })
    }

    /// Reads one mip level of a texture, rows tightly packed.
    pub fn read_texture(
        &self,
        device: &mut Device,
        texture: TextureHandle,
        level: u32,
    ) -> Result<ReadbackFuture, Error> {
        self.check(device);
        let (guard, inner, desc) = device.begin_texture_readback(texture, level)?;
        let expected = desc.level_byte_len(level);
        Ok(ReadbackFuture {
            inner: Box::pin(async move {
                let _perf = logwise::perfwarn_begin!("Readback::read_texture");
                let _guard = guard;
                let bytes = inner.await?;
                if bytes.len() != expected {
                    return Err(Error::Readback(format!(
                        "expected {expected} bytes of texture data, got {}",
                        bytes.len()
                    )));
                }
                Ok(ReadbackData { bytes })
            }),
        })
    }
}

/// Resolves to the data once the backend has finished all prior work on the resource.
///
/// Dropping the future abandons the readback and releases the resource for another one.
#[must_use = "a readback does nothing useful unless awaited"]
pub struct ReadbackFuture {
    inner: BoxFuture<Result<ReadbackData, Error>>,
}

impl std::fmt::Debug for ReadbackFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadbackFuture").finish_non_exhaustive()
    }
}

impl Future for ReadbackFuture {
    type Output = Result<ReadbackData, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

/// CPU copy of GPU data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadbackData {
    bytes: Vec<u8>,
}

impl ReadbackData {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// The data reinterpreted as `T`s.  Trailing bytes that do not fill a `T` are zero-padded.
    pub fn to_vec<T: bytemuck::Pod>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
