// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! `create_bindings` rejects every disagreement with the program's signature.

use passes_and_kernels::*;

const DATA: BindingSlot = BindingSlot::new(0, 0);
const PARAMS: BindingSlot = BindingSlot::new(0, 1);
const IMAGE: BindingSlot = BindingSlot::new(1, 0);

struct Fixture {
    swap_chain: SwapChain,
    pipeline: ComputePipelineHandle,
    data: BufferHandle,
    params: BufferHandle,
    image: TextureHandle,
}

async fn fixture() -> Fixture {
    let surface = HeadlessSurface::new(4, 4);
    let config = SwapChainConfig::default()
        .with_targets(vec![BackendKind::Software])
        .with_leak_policy(LeakPolicy::Ignore);
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let device = swap_chain.get_device();
    let shader = HostShader::compute([64, 1, 1], |_ctx| {})
        .storage(DATA, false, 256, "data")
        .uniform(PARAMS, 16, "params")
        .binding(IMAGE, BindingKind::Texture, 0, "image");
    let program = device
        .create_program(&ProgramDescriptor::compute(ShaderStage::new().host(shader)))
        .unwrap();
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineDescriptor {
            program,
            input_layout: None,
        })
        .unwrap();
    let data = device
        .create_buffer(&BufferDescriptor::with_size(256, BufferUsage::STORAGE))
        .unwrap();
    let params = device
        .create_buffer(&BufferDescriptor::with_size(16, BufferUsage::UNIFORM))
        .unwrap();
    let image = device
        .create_texture(&TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            2,
            2,
            TextureUsage::SAMPLED,
        ))
        .unwrap();
    Fixture {
        swap_chain,
        pipeline,
        data,
        params,
        image,
    }
}

fn mismatch_at(result: Result<BindingsHandle, Error>) -> (Option<BindingSlot>, String) {
    match result {
        Err(Error::ResourceMismatch(e)) => (e.slot, e.reason),
        other => panic!("expected a resource mismatch, got {other:?}"),
    }
}

#[test_executors::async_test]
async fn a_complete_descriptor_is_accepted() {
    let mut f = fixture().await;
    let desc = BindingsDescriptor::new(f.pipeline)
        .storage(DATA, f.data)
        .uniform(PARAMS, f.params)
        .texture(IMAGE, f.image);
    let device = f.swap_chain.get_device();
    let bindings = device.create_bindings(&desc).unwrap();
    device.destroy(bindings).unwrap();
}

#[test_executors::async_test]
async fn missing_slots_are_named() {
    let mut f = fixture().await;
    let desc = BindingsDescriptor::new(f.pipeline)
        .storage(DATA, f.data)
        .texture(IMAGE, f.image);
    let (slot, reason) = mismatch_at(f.swap_chain.get_device().create_bindings(&desc));
    assert_eq!(slot, Some(PARAMS));
    assert!(reason.contains("params"), "{reason}");
}

#[test_executors::async_test]
async fn unknown_slots_are_rejected() {
    let mut f = fixture().await;
    let extra = BindingSlot::new(2, 0);
    let desc = BindingsDescriptor::new(f.pipeline)
        .storage(DATA, f.data)
        .uniform(PARAMS, f.params)
        .texture(IMAGE, f.image)
        .uniform(extra, f.params);
    let (slot, _) = mismatch_at(f.swap_chain.get_device().create_bindings(&desc));
    assert_eq!(slot, Some(extra));
}

#[test_executors::async_test]
async fn kinds_must_agree() {
    let mut f = fixture().await;
    // a uniform buffer where the program reads storage
    let desc = BindingsDescriptor::new(f.pipeline)
        .uniform(DATA, f.params)
        .uniform(PARAMS, f.params)
        .texture(IMAGE, f.image);
    let (slot, _) = mismatch_at(f.swap_chain.get_device().create_bindings(&desc));
    assert_eq!(slot, Some(DATA));
}

#[test_executors::async_test]
async fn usage_flags_are_checked() {
    let mut f = fixture().await;
    let device = f.swap_chain.get_device();
    let vertices = device
        .create_buffer(&BufferDescriptor::with_size(256, BufferUsage::VERTEX))
        .unwrap();
    let render_only = device
        .create_texture(&TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            2,
            2,
            TextureUsage::RENDER_TARGET,
        ))
        .unwrap();

    let desc = BindingsDescriptor::new(f.pipeline)
        .storage(DATA, vertices)
        .uniform(PARAMS, f.params)
        .texture(IMAGE, f.image);
    let (slot, reason) = mismatch_at(device.create_bindings(&desc));
    assert_eq!(slot, Some(DATA));
    assert!(reason.contains("STORAGE"), "{reason}");

    let desc = BindingsDescriptor::new(f.pipeline)
        .storage(DATA, f.data)
        .uniform(PARAMS, f.params)
        .texture(IMAGE, render_only);
    let (slot, _) = mismatch_at(device.create_bindings(&desc));
    assert_eq!(slot, Some(IMAGE));
}

#[test_executors::async_test]
async fn bound_ranges_must_cover_what_the_program_reads() {
    let mut f = fixture().await;
    let desc = BindingsDescriptor::new(f.pipeline)
        .storage_range(DATA, f.data, 0, Some(128))
        .uniform(PARAMS, f.params)
        .texture(IMAGE, f.image);
    let (slot, reason) = mismatch_at(f.swap_chain.get_device().create_bindings(&desc));
    assert_eq!(slot, Some(DATA));
    assert!(reason.contains("256"), "{reason}");

    let desc = BindingsDescriptor::new(f.pipeline)
        .storage_range(DATA, f.data, 0, Some(512))
        .uniform(PARAMS, f.params)
        .texture(IMAGE, f.image);
    let (slot, _) = mismatch_at(f.swap_chain.get_device().create_bindings(&desc));
    assert_eq!(slot, Some(DATA));

    let desc = BindingsDescriptor::new(f.pipeline)
        .storage_range(DATA, f.data, 4, Some(u64::MAX - 1))
        .uniform(PARAMS, f.params)
        .texture(IMAGE, f.image);
    let (slot, _) = mismatch_at(f.swap_chain.get_device().create_bindings(&desc));
    assert_eq!(slot, Some(DATA));
}

#[test_executors::async_test]
async fn a_slot_binds_once() {
    let mut f = fixture().await;
    let desc = BindingsDescriptor::new(f.pipeline)
        .storage(DATA, f.data)
        .uniform(PARAMS, f.params)
        .uniform(PARAMS, f.params)
        .texture(IMAGE, f.image);
    let (slot, reason) = mismatch_at(f.swap_chain.get_device().create_bindings(&desc));
    assert_eq!(slot, Some(PARAMS));
    assert!(reason.contains("more than once"), "{reason}");
}

#[test_executors::async_test]
async fn webgl_has_no_storage_buffers() {
    let surface = HeadlessSurface::new(4, 4);
    let config = SwapChainConfig::default().with_targets(vec![BackendKind::WebGL2]);
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let device = swap_chain.get_device();
    assert!(matches!(
        device.create_buffer(&BufferDescriptor::with_size(64, BufferUsage::STORAGE)),
        Err(Error::Unsupported {
            backend: BackendKind::WebGL2,
            ..
        })
    ));
    assert!(device.check_for_leaks().is_empty());
}
