// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Backend fallback, context loss and restoration.

use passes_and_kernels::*;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test_executors::async_test]
async fn falls_back_through_the_target_list() {
    let surface = HeadlessSurface::new(4, 4)
        .without(BackendKind::WebGPU)
        .without(BackendKind::WebGL2);
    let failed = Rc::new(RefCell::new(Vec::new()));
    let seen = failed.clone();
    let config = SwapChainConfig::default()
        .with_targets(vec![BackendKind::WebGPU, BackendKind::WebGL2, BackendKind::WebGL1])
        .on_context_creation_error(move |backend, error| {
            assert!(matches!(error, Error::ContextCreation { .. }));
            seen.borrow_mut().push(backend);
        });
    let swap_chain = create_swap_chain(&surface, config).await.unwrap();
    assert_eq!(swap_chain.backend_kind(), BackendKind::WebGL1);
    assert_eq!(*failed.borrow(), vec![BackendKind::WebGPU, BackendKind::WebGL2]);
}

#[test_executors::async_test]
async fn an_oversized_onscreen_texture_falls_back() {
    // past the emulated GL's 4096-texel limit, within the software backend's
    let surface = HeadlessSurface::new(5000, 2);
    let failed = Rc::new(RefCell::new(Vec::new()));
    let seen = failed.clone();
    let config = SwapChainConfig::default()
        .with_targets(vec![BackendKind::WebGL2, BackendKind::Software])
        .on_context_creation_error(move |backend, error| {
            assert!(matches!(error, Error::InvalidDescriptor { .. }), "{error}");
            seen.borrow_mut().push(backend);
        });
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    assert_eq!(swap_chain.backend_kind(), BackendKind::Software);
    assert_eq!(*failed.borrow(), vec![BackendKind::WebGL2]);
    let onscreen = swap_chain.get_onscreen_texture().unwrap();
    let desc = swap_chain.get_device().texture_descriptor(onscreen).unwrap();
    assert_eq!((desc.width, desc.height), (5000, 2));
}

#[test_executors::async_test]
async fn an_exhausted_target_list_names_what_was_tried() {
    let surface = HeadlessSurface::new(4, 4).without(BackendKind::WebGL2);
    let config = SwapChainConfig::default().with_targets(vec![BackendKind::WebGL2]);
    match create_swap_chain(&surface, config).await {
        Err(Error::NoBackendAvailable { tried }) => assert_eq!(tried, vec![BackendKind::WebGL2]),
        other => panic!("expected NoBackendAvailable, got {other:?}"),
    }
}

#[test_executors::async_test]
async fn lost_contexts_invalidate_old_handles() {
    let surface = HeadlessSurface::new(4, 4);
    let lost = Rc::new(Cell::new(0));
    let restored = Rc::new(Cell::new(0));
    let (on_lost, on_restored) = (lost.clone(), restored.clone());
    let config = SwapChainConfig::default()
        .with_targets(vec![BackendKind::WebGL2])
        .with_leak_policy(LeakPolicy::Panic)
        .on_context_lost(move || on_lost.set(on_lost.get() + 1))
        .on_context_restored(move || on_restored.set(on_restored.get() + 1));
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let old_onscreen = swap_chain.get_onscreen_texture().unwrap();
    let device = swap_chain.get_device();
    let buffer = device
        .create_buffer(&BufferDescriptor::with_data(
            &[1, 2, 3, 4],
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
        ))
        .unwrap();
    let gl = surface.gl().unwrap();

    gl.lose_context();
    assert!(matches!(
        device.write_buffer(buffer, 0, &[5]),
        Err(Error::ContextLost)
    ));
    assert_eq!(device.context_state(), ContextState::Lost);
    assert_eq!(lost.get(), 1);
    assert!(matches!(
        device.create_buffer(&BufferDescriptor::with_size(4, BufferUsage::VERTEX)),
        Err(Error::ContextLost)
    ));
    // the loss is reported once
    assert_eq!(lost.get(), 1);
    assert!(device.check_for_leaks().is_empty());

    gl.restore_context();
    assert_eq!(device.context_state(), ContextState::Live);
    assert_eq!(restored.get(), 1);
    assert!(matches!(
        device.write_buffer(buffer, 0, &[5]),
        Err(Error::ContextLost)
    ));
    assert!(matches!(device.buffer_size(buffer), Err(Error::ContextLost)));
    assert!(matches!(
        device.texture_descriptor(old_onscreen),
        Err(Error::ContextLost)
    ));

    let fresh = device
        .create_buffer(&BufferDescriptor::with_data(
            &[9, 8, 7, 6],
            BufferUsage::VERTEX | BufferUsage::COPY_SRC,
        ))
        .unwrap();
    let readback = device.create_readback();
    let data = readback.read_buffer(device, fresh).unwrap().await.unwrap();
    assert_eq!(data.as_bytes(), &[9, 8, 7, 6]);
    device.destroy(fresh).unwrap();

    let onscreen = swap_chain.get_onscreen_texture().unwrap();
    assert_ne!(onscreen, old_onscreen);
    swap_chain.present().unwrap();
}

#[test_executors::async_test]
async fn readbacks_in_flight_fail_on_loss() {
    let surface = HeadlessSurface::new(4, 4);
    let config = SwapChainConfig::default()
        .with_targets(vec![BackendKind::WebGL2])
        .with_leak_policy(LeakPolicy::Ignore);
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let device = swap_chain.get_device();
    let buffer = device
        .create_buffer(&BufferDescriptor::with_data(
            &[1, 2, 3, 4],
            BufferUsage::VERTEX | BufferUsage::COPY_SRC,
        ))
        .unwrap();
    let readback = device.create_readback();
    let pending = readback.read_buffer(device, buffer).unwrap();
    surface.gl().unwrap().lose_context();
    assert!(pending.await.is_err());
}
