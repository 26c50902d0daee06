// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Object lifetimes: explicit destroy, leak reports, and the drop policy.

use passes_and_kernels::*;

async fn open(surface: &HeadlessSurface, backend: BackendKind, policy: LeakPolicy) -> SwapChain {
    let config = SwapChainConfig::default()
        .with_targets(vec![backend])
        .with_leak_policy(policy);
    create_swap_chain(surface, config).await.unwrap()
}

#[test_executors::async_test]
async fn live_objects_are_reported_by_name() {
    let surface = HeadlessSurface::new(4, 4);
    let mut swap_chain = open(&surface, BackendKind::Software, LeakPolicy::Ignore).await;
    let device = swap_chain.get_device();
    let baseline = device.live_object_count();
    assert!(device.check_for_leaks().is_empty());

    let buffer = device
        .create_buffer(&BufferDescriptor::with_size(64, BufferUsage::VERTEX))
        .unwrap();
    let texture = device
        .create_texture(&TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            2,
            2,
            TextureUsage::SAMPLED,
        ))
        .unwrap();
    let sampler = device.create_sampler(&SamplerDescriptor::default()).unwrap();
    device.set_resource_name(buffer, "vertices").unwrap();
    assert_eq!(device.live_object_count(), baseline + 3);

    let leaks = device.check_for_leaks();
    assert_eq!(leaks.len(), 3);
    let named = leaks
        .iter()
        .find(|l| l.kind == ResourceKind::Buffer)
        .unwrap();
    assert_eq!(named.name.as_deref(), Some("vertices"));
    assert!(named.to_string().contains("\"vertices\""));
    assert!(
        leaks
            .iter()
            .filter(|l| l.kind != ResourceKind::Buffer)
            .all(|l| l.name.is_none())
    );

    device.destroy(buffer).unwrap();
    device.destroy(texture).unwrap();
    device.destroy(sampler).unwrap();
    assert!(device.check_for_leaks().is_empty());
    assert_eq!(device.live_object_count(), baseline);
}

#[test_executors::async_test]
async fn the_onscreen_texture_is_not_a_leak() {
    let surface = HeadlessSurface::new(4, 4);
    let mut swap_chain = open(&surface, BackendKind::WebGL2, LeakPolicy::Panic).await;
    let onscreen = swap_chain.get_onscreen_texture().unwrap();
    let device = swap_chain.get_device();
    assert!(device.check_for_leaks().is_empty());
    assert!(matches!(
        device.destroy(onscreen),
        Err(Error::InvalidDescriptor { .. })
    ));
    // still usable
    assert_eq!(device.texture_descriptor(onscreen).unwrap().width, 4);
}

#[test_executors::async_test]
async fn destroy_releases_native_objects() {
    let surface = HeadlessSurface::new(4, 4);
    let mut swap_chain = open(&surface, BackendKind::WebGL2, LeakPolicy::Panic).await;
    let device = swap_chain.get_device();
    let gl = surface.gl().unwrap();
    let before = gl.live_objects();

    let buffer = device
        .create_buffer(&BufferDescriptor::with_size(64, BufferUsage::VERTEX))
        .unwrap();
    let texture = device
        .create_texture(&TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            2,
            2,
            TextureUsage::SAMPLED,
        ))
        .unwrap();
    assert!(gl.live_objects() >= before + 2);

    device.destroy(buffer).unwrap();
    device.destroy(texture).unwrap();
    assert_eq!(gl.live_objects(), before);
}

#[test]
#[should_panic(expected = "use of destroyed")]
fn destroyed_handles_panic() {
    test_executors::spin_on(async {
        let surface = HeadlessSurface::new(4, 4);
        let mut swap_chain = open(&surface, BackendKind::Software, LeakPolicy::Ignore).await;
        let device = swap_chain.get_device();
        let buffer = device
            .create_buffer(&BufferDescriptor::with_size(16, BufferUsage::VERTEX))
            .unwrap();
        device.destroy(buffer).unwrap();
        let _ = device.destroy(buffer);
    });
}

#[test]
#[should_panic(expected = "device dropped with live objects")]
fn panic_policy_catches_leaks() {
    test_executors::spin_on(async {
        let surface = HeadlessSurface::new(4, 4);
        let mut swap_chain = open(&surface, BackendKind::Software, LeakPolicy::Panic).await;
        let device = swap_chain.get_device();
        let buffer = device
            .create_buffer(&BufferDescriptor::with_size(16, BufferUsage::VERTEX))
            .unwrap();
        device.set_resource_name(buffer, "forgotten").unwrap();
        drop(swap_chain);
    });
}
