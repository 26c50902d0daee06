// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Render pass recording, validation at submission, and what reaches the attachments.

use passes_and_kernels::*;
use std::cell::Cell;
use std::rc::Rc;

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

async fn software() -> SwapChain {
    let surface = HeadlessSurface::new(4, 4);
    let config = SwapChainConfig::default()
        .with_targets(vec![BackendKind::Software])
        .with_leak_policy(LeakPolicy::Ignore);
    create_swap_chain(&surface, config).await.unwrap()
}

fn target(device: &mut Device) -> TextureHandle {
    device
        .create_texture(&TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            4,
            4,
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        ))
        .unwrap()
}

/// A pipeline whose fragment stage paints the diagonal red and counts the vertices it was given.
fn diagonal_pipeline(device: &mut Device, seen: Rc<Cell<u32>>) -> RenderPipelineHandle {
    let fragment = HostShader::fragment(move |ctx| {
        seen.set(seen.get() + ctx.vertices().len() as u32);
        let target = ctx.target(0);
        for i in 0..target.width().min(target.height()) {
            target.put_pixel(i, i, [1.0, 0.0, 0.0, 1.0]);
        }
    })
    .output(0, ScalarClass::Float);
    let program = device
        .create_program(&ProgramDescriptor::render(
            ShaderStage::new().host(HostShader::vertex()),
            ShaderStage::new().host(fragment),
        ))
        .unwrap();
    device
        .create_render_pipeline(&RenderPipelineDescriptor::new(
            program,
            TextureFormat::Rgba8Unorm,
        ))
        .unwrap()
}

async fn texels(device: &mut Device, texture: TextureHandle) -> Vec<[u8; 4]> {
    let data = device
        .create_readback()
        .read_texture(device, texture, 0)
        .unwrap()
        .await
        .unwrap();
    data.to_vec::<[u8; 4]>()
}

#[test_executors::async_test]
async fn fragment_stages_write_the_target() {
    let mut swap_chain = software().await;
    let device = swap_chain.get_device();
    let texture = target(device);
    let seen = Rc::new(Cell::new(0));
    let pipeline = diagonal_pipeline(device, seen.clone());

    let mut pass = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(texture).clear([0.0, 0.0, 1.0, 1.0])],
            depth_stencil_attachment: None,
        })
        .unwrap();
    pass.set_pipeline(pipeline);
    pass.draw(0..3, 0..1);
    device.submit_pass(pass).unwrap();
    assert_eq!(seen.get(), 3);

    let pixels = texels(device, texture).await;
    for y in 0..4 {
        for x in 0..4 {
            let expected = if x == y { RED } else { BLUE };
            assert_eq!(pixels[y * 4 + x], expected, "texel ({x}, {y})");
        }
    }
}

#[test_executors::async_test]
async fn loads_keep_previous_contents() {
    let mut swap_chain = software().await;
    let device = swap_chain.get_device();
    let texture = target(device);
    let clear = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(texture).clear([0.0, 0.0, 1.0, 1.0])],
            depth_stencil_attachment: None,
        })
        .unwrap();
    device.submit_pass(clear).unwrap();
    // no clear value: the blue survives
    let load = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(texture)],
            depth_stencil_attachment: None,
        })
        .unwrap();
    device.submit_pass(load).unwrap();
    assert!(texels(device, texture).await.iter().all(|t| *t == BLUE));
}

#[test_executors::async_test]
async fn invalid_passes_run_nothing() {
    let mut swap_chain = software().await;
    let device = swap_chain.get_device();
    let texture = target(device);

    let mut pass = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(texture).clear([0.0, 1.0, 0.0, 1.0])],
            depth_stencil_attachment: None,
        })
        .unwrap();
    pass.set_viewport(Viewport::new(0.0, 0.0, 4.0, 4.0));
    pass.draw(0..3, 0..1);
    match device.submit_pass(pass) {
        Err(Error::InvalidPass { index, reason }) => {
            assert_eq!(index, 1);
            assert!(reason.contains("set_pipeline"), "{reason}");
        }
        other => panic!("expected InvalidPass, got {other:?}"),
    }
    // the clear did not happen either
    assert!(texels(device, texture).await.iter().all(|t| *t == [0; 4]));
}

#[test_executors::async_test]
async fn destroyed_programs_fail_the_whole_pass() {
    let mut swap_chain = software().await;
    let device = swap_chain.get_device();
    let texture = target(device);
    let painted = Rc::new(Cell::new(0));
    let live = diagonal_pipeline(device, painted.clone());
    let program = device
        .create_program(&ProgramDescriptor::render(
            ShaderStage::new().host(HostShader::vertex()),
            ShaderStage::new().host(HostShader::fragment(|_ctx| {}).output(0, ScalarClass::Float)),
        ))
        .unwrap();
    let orphaned = device
        .create_render_pipeline(&RenderPipelineDescriptor::new(
            program,
            TextureFormat::Rgba8Unorm,
        ))
        .unwrap();
    device.destroy(program).unwrap();

    let mut pass = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(texture).clear([0.0, 0.0, 1.0, 1.0])],
            depth_stencil_attachment: None,
        })
        .unwrap();
    pass.set_pipeline(live);
    pass.draw(0..3, 0..1);
    pass.set_pipeline(orphaned);
    pass.draw(0..3, 0..1);
    match device.submit_pass(pass) {
        Err(Error::InvalidPass { index, reason }) => {
            assert_eq!(index, 2);
            assert!(reason.contains("program"), "{reason}");
        }
        other => panic!("expected InvalidPass, got {other:?}"),
    }
    // neither the clear nor the first draw ran
    assert_eq!(painted.get(), 0);
    assert!(texels(device, texture).await.iter().all(|t| *t == [0; 4]));
}

#[test_executors::async_test]
async fn one_pass_records_at_a_time() {
    let mut swap_chain = software().await;
    let device = swap_chain.get_device();
    let texture = target(device);
    let desc = RenderPassDescriptor {
        color_attachments: vec![ColorAttachment::new(texture)],
        depth_stencil_attachment: None,
    };

    let first = device.create_render_pass(desc.clone()).unwrap();
    assert!(matches!(
        device.create_render_pass(desc.clone()),
        Err(Error::PassInProgress)
    ));
    assert!(matches!(
        device.create_compute_pass(),
        Err(Error::PassInProgress)
    ));
    // abandoning a pass frees the device
    drop(first);
    let second = device.create_render_pass(desc).unwrap();
    device.submit_pass(second).unwrap();
}

#[test_executors::async_test]
async fn attachments_must_agree() {
    let mut swap_chain = software().await;
    let device = swap_chain.get_device();
    let texture = target(device);
    let small = device
        .create_texture(&TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            2,
            2,
            TextureUsage::RENDER_TARGET,
        ))
        .unwrap();
    let sampled_only = device
        .create_texture(&TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            4,
            4,
            TextureUsage::SAMPLED,
        ))
        .unwrap();

    assert!(matches!(
        device.create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(texture), ColorAttachment::new(small)],
            depth_stencil_attachment: None,
        }),
        Err(Error::InvalidDescriptor { .. })
    ));
    assert!(matches!(
        device.create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(sampled_only)],
            depth_stencil_attachment: None,
        }),
        Err(Error::InvalidDescriptor { .. })
    ));
    assert!(matches!(
        device.create_render_pass(RenderPassDescriptor::default()),
        Err(Error::InvalidDescriptor { .. })
    ));
}

#[test_executors::async_test]
async fn pipelines_must_match_the_attachments() {
    let mut swap_chain = software().await;
    let device = swap_chain.get_device();
    let pipeline = diagonal_pipeline(device, Rc::new(Cell::new(0)));
    let float_target = device
        .create_texture(&TextureDescriptor::new_2d(
            TextureFormat::Rgba32Float,
            4,
            4,
            TextureUsage::RENDER_TARGET,
        ))
        .unwrap();
    let mut pass = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(float_target)],
            depth_stencil_attachment: None,
        })
        .unwrap();
    pass.set_pipeline(pipeline);
    pass.draw(0..3, 0..1);
    assert!(matches!(
        device.submit_pass(pass),
        Err(Error::InvalidPass { index: 0, .. })
    ));
}

#[test_executors::async_test]
async fn a_target_cannot_be_sampled_in_its_own_pass() {
    let mut swap_chain = software().await;
    let device = swap_chain.get_device();
    let texture = target(device);
    let slot = BindingSlot::new(0, 0);
    let fragment = HostShader::fragment(|_ctx| {})
        .binding(slot, BindingKind::Texture, 0, "previous")
        .output(0, ScalarClass::Float);
    let program = device
        .create_program(&ProgramDescriptor::render(
            ShaderStage::new().host(HostShader::vertex()),
            ShaderStage::new().host(fragment),
        ))
        .unwrap();
    let pipeline = device
        .create_render_pipeline(&RenderPipelineDescriptor::new(
            program,
            TextureFormat::Rgba8Unorm,
        ))
        .unwrap();
    let bindings = device
        .create_bindings(&BindingsDescriptor::new(pipeline).texture(slot, texture))
        .unwrap();
    device.set_resource_name(texture, "feedback").unwrap();

    let mut pass = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(texture)],
            depth_stencil_attachment: None,
        })
        .unwrap();
    pass.set_pipeline(pipeline);
    pass.set_bindings(bindings);
    pass.draw(0..3, 0..1);
    match device.submit_pass(pass) {
        Err(Error::InvalidPass { index, reason }) => {
            assert_eq!(index, 1);
            assert!(reason.contains("feedback"), "{reason}");
        }
        other => panic!("expected InvalidPass, got {other:?}"),
    }
}

#[test_executors::async_test]
async fn webgl_clears_the_onscreen_texture() {
    let surface = HeadlessSurface::new(4, 4);
    let config = SwapChainConfig::default().with_targets(vec![BackendKind::WebGL2]);
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let onscreen = swap_chain.get_onscreen_texture().unwrap();
    let device = swap_chain.get_device();
    let pass = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(onscreen).clear([1.0, 0.0, 0.0, 1.0])],
            depth_stencil_attachment: None,
        })
        .unwrap();
    device.submit_pass(pass).unwrap();
    assert!(texels(device, onscreen).await.iter().all(|t| *t == RED));
    swap_chain.present().unwrap();

    swap_chain.configure_swap_chain(8, 2).unwrap();
    let onscreen = swap_chain.get_onscreen_texture().unwrap();
    let desc = swap_chain.get_device().texture_descriptor(onscreen).unwrap();
    assert_eq!((desc.width, desc.height), (8, 2));
}
