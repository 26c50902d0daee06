// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Drives `map_async` callbacks.
//!
//! Native wgpu only fires mapping callbacks from `Device::poll`.  A dedicated thread waits for
//! a trigger and then polls until the queue is idle, so a readback future makes progress without
//! the caller polling the device.  In the browser the page's event loop does this for us.

#[cfg(not(target_arch = "wasm32"))]
use std::sync::Arc;
#[cfg(not(target_arch = "wasm32"))]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(not(target_arch = "wasm32"))]
use std::sync::mpsc::{self, Receiver, Sender};
#[cfg(not(target_arch = "wasm32"))]
use std::thread::{self, JoinHandle};

#[derive(Debug)]
pub(super) struct Poller {
    #[cfg(not(target_arch = "wasm32"))]
    thread: Option<JoinHandle<()>>,
    #[cfg(not(target_arch = "wasm32"))]
    shutdown: Arc<AtomicBool>,
    #[cfg(not(target_arch = "wasm32"))]
    trigger: Sender<()>,
}

impl Poller {
    #[cfg(not(target_arch = "wasm32"))]
    pub(super) fn new(device: wgpu::Device) -> Result<Self, String> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let (trigger, receiver): (Sender<()>, Receiver<()>) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("wgpu_poll".to_string())
            .spawn(move || {
                while !shutdown_clone.load(Ordering::Relaxed) {
                    match receiver.recv() {
                        Ok(()) => {
                            let _ = device.poll(wgpu::PollType::Wait);
                        }
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| format!("could not spawn the wgpu poll thread: {e}"))?;
        Ok(Poller {
            thread: Some(thread),
            shutdown,
            trigger,
        })
    }

    #[cfg(target_arch = "wasm32")]
    pub(super) fn new(_device: wgpu::Device) -> Result<Self, String> {
        Ok(Poller {})
    }

    /// Signals that submitted work has a callback waiting on it.
    pub(super) fn trigger(&self) {
        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = self.trigger.send(());
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // wake the thread so it observes the flag
        let _ = self.trigger.send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
