// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Backend selection and the onscreen texture.

[`create_swap_chain`] walks the configured target list in order and keeps the first backend
whose context can be created.  A failure is reported to the `on_context_creation_error`
callback and logged, and the next target is tried.  Only when every target fails does the call
return [`Error::NoBackendAvailable`].

```
# use passes_and_kernels::*;
# test_executors::spin_on(async {
let surface = HeadlessSurface::new(64, 64).without(BackendKind::WebGL2);
let config = SwapChainConfig::default()
    .with_targets(vec![BackendKind::WebGL2, BackendKind::WebGL1]);
let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
assert_eq!(swap_chain.backend_kind(), BackendKind::WebGL1);
# });
```
*/

use crate::device::Device;
use crate::error::Error;
use crate::format::TextureFormat;
use crate::handles::TextureHandle;
use crate::imp::Backend;
use crate::imp::software::SoftwareBackend;
use crate::imp::webgl::{GlContext, GlVersion, HeadlessGl, WebGlBackend};
use crate::resources::{TextureDescriptor, TextureUsage};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;
use std::str::FromStr;

/// Name of the environment variable read by [`SwapChainConfig::from_env_or_default`].
pub const BACKENDS_ENV: &str = "PASSES_AND_KERNELS_BACKENDS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    WebGL1,
    WebGL2,
    WebGPU,
    /// Host-side execution.  Always available.
    Software,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::WebGL1 => "WebGL1",
            BackendKind::WebGL2 => "WebGL2",
            BackendKind::WebGPU => "WebGPU",
            BackendKind::Software => "Software",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webgl1" => Ok(BackendKind::WebGL1),
            "webgl2" => Ok(BackendKind::WebGL2),
            "webgpu" => Ok(BackendKind::WebGPU),
            "software" => Ok(BackendKind::Software),
            other => Err(format!("unknown backend {other:?}")),
        }
    }
}

/**
Something a swap chain can present to.

# Safety

Handles returned from [`Surface::window_handles`] must stay valid for as long as any swap chain
created from this surface is alive.
*/
pub unsafe trait Surface {
    /// Size of the drawable area in physical pixels.
    fn size(&self) -> (u32, u32);

    /// Gives the surface a chance to refuse a backend before anything is created.
    fn accepts(&self, _backend: BackendKind) -> Result<(), String> {
        Ok(())
    }

    /// Creates a WebGL context of the given version.
    fn create_gl_context(
        &self,
        version: GlVersion,
        _antialias: bool,
    ) -> Result<Rc<dyn GlContext>, String> {
        Err(format!("this surface cannot create a {version:?} context"))
    }

    /// Native handles for a presentable WebGPU surface.  `None` runs WebGPU offscreen.
    fn window_handles(&self) -> Option<(RawWindowHandle, RawDisplayHandle)> {
        None
    }
}

/// A surface with no window.  GL contexts are served by [`HeadlessGl`].
#[derive(Debug)]
pub struct HeadlessSurface {
    width: u32,
    height: u32,
    refused: Vec<BackendKind>,
    last_gl: RefCell<Option<HeadlessGl>>,
}

impl HeadlessSurface {
    pub fn new(width: u32, height: u32) -> Self {
        HeadlessSurface {
            width,
            height,
            refused: Vec::new(),
            last_gl: RefCell::new(None),
        }
    }

    /// Makes context creation fail for `backend`, as a browser without it would.
    pub fn without(mut self, backend: BackendKind) -> Self {
        self.refused.push(backend);
        self
    }

    /// The emulator behind the most recently created GL context.
    pub fn gl(&self) -> Option<HeadlessGl> {
        self.last_gl.borrow().clone()
    }
}

unsafe impl Surface for HeadlessSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn accepts(&self, backend: BackendKind) -> Result<(), String> {
        if self.refused.contains(&backend) {
            Err(format!("{backend} is disabled on this surface"))
        } else {
            Ok(())
        }
    }

    fn create_gl_context(
        &self,
        version: GlVersion,
        _antialias: bool,
    ) -> Result<Rc<dyn GlContext>, String> {
        let gl = HeadlessGl::new(version, self.width, self.height);
        *self.last_gl.borrow_mut() = Some(gl.clone());
        Ok(Rc::new(gl))
    }
}

/// A `<canvas>` element.
#[cfg(target_arch = "wasm32")]
#[derive(Debug)]
pub struct CanvasSurface {
    canvas: web_sys::HtmlCanvasElement,
}

#[cfg(target_arch = "wasm32")]
impl CanvasSurface {
    pub fn new(canvas: web_sys::HtmlCanvasElement) -> Self {
        CanvasSurface { canvas }
    }
}

#[cfg(target_arch = "wasm32")]
unsafe impl Surface for CanvasSurface {
    fn size(&self) -> (u32, u32) {
        (self.canvas.width(), self.canvas.height())
    }

    fn create_gl_context(
        &self,
        version: GlVersion,
        antialias: bool,
    ) -> Result<Rc<dyn GlContext>, String> {
        crate::imp::webgl::web_sys_context::create(&self.canvas, version, antialias)
    }

    fn window_handles(&self) -> Option<(RawWindowHandle, RawDisplayHandle)> {
        let value: &wasm_bindgen::JsValue = self.canvas.as_ref();
        let obj = std::ptr::NonNull::from(value).cast();
        Some((
            RawWindowHandle::WebCanvas(raw_window_handle::WebCanvasWindowHandle::new(obj)),
            RawDisplayHandle::Web(raw_window_handle::WebDisplayHandle::new()),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerPreference {
    #[default]
    Default,
    LowPower,
    HighPerformance,
}

/// What a device does with objects still alive when it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeakPolicy {
    Ignore,
    /// Log one warning per leaked object.
    #[default]
    Warn,
    /// Panic, unless the thread is already panicking.
    Panic,
}

type CreationErrorFn = Rc<dyn Fn(BackendKind, &Error)>;

#[derive(Clone, Default)]
pub(crate) struct ContextCallbacks {
    creation_error: Option<CreationErrorFn>,
    lost: Option<Rc<dyn Fn()>>,
    restored: Option<Rc<dyn Fn()>>,
}

impl ContextCallbacks {
    pub(crate) fn context_creation_error(&self, backend: BackendKind, error: &Error) {
        if let Some(f) = &self.creation_error {
            f(backend, error);
        }
    }

    pub(crate) fn context_lost(&self) {
        if let Some(f) = &self.lost {
            f();
        }
    }

    pub(crate) fn context_restored(&self) {
        if let Some(f) = &self.restored {
            f();
        }
    }
}

impl std::fmt::Debug for ContextCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCallbacks")
            .field("creation_error", &self.creation_error.is_some())
            .field("lost", &self.lost.is_some())
            .field("restored", &self.restored.is_some())
            .finish()
    }
}

/// Configuration for [`create_swap_chain`].
#[derive(Debug, Clone)]
pub struct SwapChainConfig {
    /// Tried in order; the first that works wins.
    pub targets: Vec<BackendKind>,
    pub power_preference: PowerPreference,
    /// Requests a multisampled default framebuffer where the backend supports one.
    pub antialias: bool,
    pub leak_policy: LeakPolicy,
    callbacks: ContextCallbacks,
}

impl Default for SwapChainConfig {
    fn default() -> Self {
        SwapChainConfig {
            targets: vec![BackendKind::WebGL2, BackendKind::WebGL1, BackendKind::WebGPU],
            power_preference: PowerPreference::Default,
            antialias: false,
            leak_policy: LeakPolicy::Warn,
            callbacks: ContextCallbacks::default(),
        }
    }
}

impl SwapChainConfig {
    /// Default configuration, with the target list taken from `PASSES_AND_KERNELS_BACKENDS`
    /// (comma separated, e.g. `webgpu,software`) when it is set.
    pub fn from_env_or_default() -> Self {
        let mut config = SwapChainConfig::default();
        if let Ok(value) = std::env::var(BACKENDS_ENV) {
            let targets = parse_targets(&value);
            if targets.is_empty() {
                logwise::warn_sync!(
                    "{var} set but names no usable backend; using defaults",
                    var = BACKENDS_ENV
                );
            } else {
                config.targets = targets;
            }
        }
        config
    }

    pub fn with_targets(mut self, targets: Vec<BackendKind>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_power_preference(mut self, power_preference: PowerPreference) -> Self {
        self.power_preference = power_preference;
        self
    }

    pub fn with_antialias(mut self, antialias: bool) -> Self {
        self.antialias = antialias;
        self
    }

    pub fn with_leak_policy(mut self, leak_policy: LeakPolicy) -> Self {
        self.leak_policy = leak_policy;
        self
    }

    /// Called once per backend that fails to initialize.
    pub fn on_context_creation_error(
        mut self,
        f: impl Fn(BackendKind, &Error) + 'static,
    ) -> Self {
        self.callbacks.creation_error = Some(Rc::new(f));
        self
    }

    /// Called when the device first observes that its context is gone.
    pub fn on_context_lost(mut self, f: impl Fn() + 'static) -> Self {
        self.callbacks.lost = Some(Rc::new(f));
        self
    }

    /// Called when the context is usable again.  Resources must be recreated from here on.
    pub fn on_context_restored(mut self, f: impl Fn() + 'static) -> Self {
        self.callbacks.restored = Some(Rc::new(f));
        self
    }
}

fn parse_targets(value: &str) -> Vec<BackendKind> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| match s.parse() {
            Ok(kind) => Some(kind),
            Err(e) => {
                logwise::warn_sync!("{var}: {e}", var = BACKENDS_ENV, e = e);
                None
            }
        })
        .collect()
}

async fn open_backend(
    surface: &dyn Surface,
    kind: BackendKind,
    config: &SwapChainConfig,
) -> Result<(Box<dyn Backend>, TextureFormat), Error> {
    let creation = |reason: String| Error::ContextCreation {
        backend: kind,
        reason,
    };
    surface.accepts(kind).map_err(creation)?;
    let (width, height) = surface.size();
    match kind {
        BackendKind::Software => Ok((
            Box::new(SoftwareBackend::new(width, height)),
            TextureFormat::Rgba8Unorm,
        )),
        BackendKind::WebGL1 | BackendKind::WebGL2 => {
            let version = if kind == BackendKind::WebGL2 {
                GlVersion::WebGl2
            } else {
                GlVersion::WebGl1
            };
            let gl = surface
                .create_gl_context(version, config.antialias)
                .map_err(creation)?;
            let backend = WebGlBackend::new(gl, version)?;
            Ok((Box::new(backend), TextureFormat::Rgba8Unorm))
        }
        #[cfg(feature = "backend_wgpu")]
        BackendKind::WebGPU => {
            let backend = crate::imp::wgpu::WgpuBackend::new(surface, config).await?;
            let format = backend.onscreen_format();
            Ok((Box::new(backend), format))
        }
        #[cfg(not(feature = "backend_wgpu"))]
        BackendKind::WebGPU => Err(creation(
            "built without the backend_wgpu feature".to_string(),
        )),
    }
}

/// Opens `kind` and creates the device with its onscreen texture.  Either step failing moves
/// on to the next target.
async fn open_device(
    surface: &dyn Surface,
    kind: BackendKind,
    config: &SwapChainConfig,
) -> Result<Device, Error> {
    let (width, height) = surface.size();
    let (backend, format) = open_backend(surface, kind, config).await?;
    let onscreen = TextureDescriptor::new_2d(
        format,
        width,
        height,
        TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
    );
    Device::new(
        backend,
        config.callbacks.clone(),
        config.leak_policy,
        onscreen,
    )
}

/// Picks a backend for `surface` and creates its device.
pub async fn create_swap_chain(
    surface: &dyn Surface,
    config: SwapChainConfig,
) -> Result<SwapChain, Error> {
    let (width, height) = surface.size();
    if width == 0 || height == 0 {
        return Err(Error::invalid_descriptor(
            "swap chain",
            "the surface has no area",
        ));
    }
    let mut tried = Vec::new();
    for &kind in &config.targets {
        tried.push(kind);
        match open_device(surface, kind, &config).await {
            Ok(device) => {
                logwise::info_sync!(
                    "selected the {backend} backend for a {width}x{height} surface",
                    backend = logwise::privacy::LogIt(&kind),
                    width = width,
                    height = height
                );
                return Ok(SwapChain { device });
            }
            Err(e) => {
                logwise::warn_sync!(
                    "{backend} backend unavailable: {e}",
                    backend = logwise::privacy::LogIt(&kind),
                    e = logwise::privacy::LogIt(&e)
                );
                config.callbacks.context_creation_error(kind, &e);
            }
        }
    }
    logwise::error_sync!(
        "no backend could be initialized from {tried}",
        tried = logwise::privacy::LogIt(&tried)
    );
    Err(Error::NoBackendAvailable { tried })
}

/// Owns the device and the presentable texture.
#[derive(Debug)]
pub struct SwapChain {
    device: Device,
}

impl SwapChain {
    pub fn get_device(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.device.backend_kind()
    }

    /// The texture to render into for the next presented frame.
    ///
    /// It is owned by the swap chain: it cannot be destroyed and is not reported as a leak.
    /// After a context loss a new handle is issued once the context is restored.
    pub fn get_onscreen_texture(&mut self) -> Result<TextureHandle, Error> {
        self.device.onscreen_texture()
    }

    /// Resizes the onscreen texture.
    pub fn configure_swap_chain(&mut self, width: u32, height: u32) -> Result<(), Error> {
        self.device.configure(width, height)
    }

    /// Shows the onscreen texture's current contents.
    pub fn present(&mut self) -> Result<(), Error> {
        self.device.present()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn parses_target_lists() {
        assert_eq!(
            parse_targets("webgpu, Software"),
            vec![BackendKind::WebGPU, BackendKind::Software]
        );
        assert_eq!(parse_targets("metal,webgl1"), vec![BackendKind::WebGL1]);
        assert!(parse_targets("").is_empty());
    }

    #[test_executors::async_test]
    async fn falls_back_in_order() {
        let failures = Rc::new(Cell::new(0));
        let counter = failures.clone();
        let surface = HeadlessSurface::new(32, 32)
            .without(BackendKind::WebGL2)
            .without(BackendKind::WebGL1);
        let config = SwapChainConfig::default()
            .with_targets(vec![
                BackendKind::WebGL2,
                BackendKind::WebGL1,
                BackendKind::Software,
            ])
            .on_context_creation_error(move |_, e| {
                assert!(matches!(e, Error::ContextCreation { .. }));
                counter.set(counter.get() + 1);
            });
        let swap_chain = create_swap_chain(&surface, config).await.unwrap();
        assert_eq!(swap_chain.backend_kind(), BackendKind::Software);
        assert_eq!(failures.get(), 2);
    }

    #[test_executors::async_test]
    async fn exhausted_targets() {
        let surface = HeadlessSurface::new(8, 8).without(BackendKind::Software);
        let config = SwapChainConfig::default().with_targets(vec![BackendKind::Software]);
        match create_swap_chain(&surface, config).await {
            Err(Error::NoBackendAvailable { tried }) => {
                assert_eq!(tried, vec![BackendKind::Software])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_executors::async_test]
    async fn onscreen_texture_resizes() {
        let surface = HeadlessSurface::new(8, 8);
        let config = SwapChainConfig::default().with_targets(vec![BackendKind::Software]);
        let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
        let onscreen = swap_chain.get_onscreen_texture().unwrap();
        swap_chain.configure_swap_chain(20, 10).unwrap();
        let desc = swap_chain.get_device().texture_descriptor(onscreen).unwrap();
        assert_eq!((desc.width, desc.height), (20, 10));
        assert!(swap_chain.get_device().destroy(onscreen).is_err());
        assert!(swap_chain.get_device().check_for_leaks().is_empty());
        swap_chain.present().unwrap();
    }
}
