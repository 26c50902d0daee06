// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Uniform uploads through the WebGL backends, observed on the headless GL emulator.

use passes_and_kernels::gl::HeadlessGl;
use passes_and_kernels::*;

const VERTEX: &str = "#version 450
layout(set = 0, binding = 0) uniform Params {
    mat3 basis;
    vec2 offset;
    int mode;
    bool flip;
} params;
layout(location = 0) in vec2 position;
void main() {
    vec3 p = params.basis * vec3(position + params.offset, 1.0);
    if (params.flip && params.mode > 0) { p = -p; }
    gl_Position = vec4(p, 1.0);
}
";

const FRAGMENT: &str = "#version 450
layout(location = 0) out vec4 color;
void main() { color = vec4(1.0); }
";

/// std140 bytes of `Params`.
fn params(offset: [f32; 2], mode: i32) -> Vec<u8> {
    let mut bytes = vec![0u8; 64];
    for column in 0..3 {
        let at = column * 16 + column * 4;
        bytes[at..at + 4].copy_from_slice(&1.0f32.to_le_bytes());
    }
    bytes[48..52].copy_from_slice(&offset[0].to_le_bytes());
    bytes[52..56].copy_from_slice(&offset[1].to_le_bytes());
    bytes[56..60].copy_from_slice(&mode.to_le_bytes());
    bytes[60..64].copy_from_slice(&1u32.to_le_bytes());
    bytes
}

struct Scene {
    onscreen: TextureHandle,
    pipeline: RenderPipelineHandle,
    bindings: BindingsHandle,
    uniforms: BufferHandle,
    vertices: BufferHandle,
}

fn build(device: &mut Device, onscreen: TextureHandle) -> Scene {
    let program = device
        .create_program(&ProgramDescriptor::render(
            ShaderStage::new().glsl(VERTEX),
            ShaderStage::new().glsl(FRAGMENT),
        ))
        .unwrap();
    let reflection = device.program_reflection(program).unwrap();
    assert_eq!(reflection.signature.len(), 1);
    assert_eq!(reflection.signature.entries()[0].kind, BindingKind::UniformBuffer);
    assert_eq!(reflection.signature.entries()[0].min_size, 64);

    let layout = device
        .create_input_layout(&InputLayoutDescriptor {
            vertex_buffers: vec![VertexBufferLayout {
                stride: 8,
                step_mode: VertexStepMode::Vertex,
                attributes: vec![VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x2,
                    offset: 0,
                }],
            }],
            index_format: None,
        })
        .unwrap();
    let format = device.texture_descriptor(onscreen).unwrap().format;
    let pipeline = device
        .create_render_pipeline(&RenderPipelineDescriptor {
            input_layout: Some(layout),
            ..RenderPipelineDescriptor::new(program, format)
        })
        .unwrap();
    let uniforms = device
        .create_buffer(&BufferDescriptor::with_data(
            &params([0.5, 0.25], 2),
            BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        ))
        .unwrap();
    let triangle = [0.0f32, 0.0, 1.0, 0.0, 0.0, 1.0];
    let vertices = device
        .create_buffer(&BufferDescriptor::with_data(
            bytemuck::cast_slice(&triangle),
            BufferUsage::VERTEX,
        ))
        .unwrap();
    let bindings = device
        .create_bindings(
            &BindingsDescriptor::new(pipeline).uniform(BindingSlot::new(0, 0), uniforms),
        )
        .unwrap();
    Scene {
        onscreen,
        pipeline,
        bindings,
        uniforms,
        vertices,
    }
}

fn draw(device: &mut Device, scene: &Scene) {
    let mut pass = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(scene.onscreen).clear([0.0, 0.0, 0.0, 1.0])],
            depth_stencil_attachment: None,
        })
        .unwrap();
    pass.set_pipeline(scene.pipeline);
    pass.set_bindings(scene.bindings);
    pass.set_vertex_input(&[scene.vertices.into()], None);
    pass.draw(0..3, 0..1);
    device.submit_pass(pass).unwrap();
}

fn uniform_calls(gl: &HeadlessGl) -> usize {
    gl.calls("uniform_fv") + gl.calls("uniform_iv") + gl.calls("uniform_matrix_fv")
}

#[test_executors::async_test]
async fn webgl1_skips_unchanged_uniforms() {
    let surface = HeadlessSurface::new(16, 16);
    let config = SwapChainConfig::default().with_targets(vec![BackendKind::WebGL1]);
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let onscreen = swap_chain.get_onscreen_texture().unwrap();
    let device = swap_chain.get_device();
    let scene = build(device, onscreen);
    let gl = surface.gl().unwrap();

    gl.reset_counts();
    draw(device, &scene);
    assert_eq!(uniform_calls(&gl), 4);
    assert_eq!(gl.calls("draw_arrays"), 1);

    gl.reset_counts();
    draw(device, &scene);
    assert_eq!(uniform_calls(&gl), 0);

    device
        .write_buffer(scene.uniforms, 56, &3i32.to_le_bytes())
        .unwrap();
    gl.reset_counts();
    draw(device, &scene);
    assert_eq!(uniform_calls(&gl), 1);
    assert_eq!(gl.uniform_ints("params_mode"), Some(vec![3]));
    assert_eq!(gl.uniform_floats("params_offset"), Some(vec![0.5, 0.25]));
}

#[test_executors::async_test]
async fn webgl2_binds_uniform_blocks() {
    let surface = HeadlessSurface::new(16, 16);
    let config = SwapChainConfig::default().with_targets(vec![BackendKind::WebGL2]);
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let onscreen = swap_chain.get_onscreen_texture().unwrap();
    let device = swap_chain.get_device();
    let scene = build(device, onscreen);
    let gl = surface.gl().unwrap();

    gl.reset_counts();
    draw(device, &scene);
    assert_eq!(gl.block_binding("Params"), Some(0));
    assert_eq!(uniform_calls(&gl), 0);
    assert_eq!(gl.calls("bind_buffer_range"), 1);
    assert_eq!(gl.calls("draw_arrays"), 1);
}

#[test_executors::async_test]
async fn clears_reach_the_drawing_buffer() {
    let surface = HeadlessSurface::new(2, 2);
    let config = SwapChainConfig::default().with_targets(vec![BackendKind::WebGL2]);
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let onscreen = swap_chain.get_onscreen_texture().unwrap();
    let device = swap_chain.get_device();
    let pass = device
        .create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachment::new(onscreen).clear([0.0, 1.0, 0.0, 1.0])],
            depth_stencil_attachment: None,
        })
        .unwrap();
    device.submit_pass(pass).unwrap();
    let pixels = surface.gl().unwrap().drawing_buffer();
    assert_eq!(&pixels[..4], &[0, 255, 0, 255]);
    swap_chain.present().unwrap();
}
