// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Upload then read back, on every backend this machine has.

use passes_and_kernels::*;

async fn open(surface: &HeadlessSurface, backend: BackendKind) -> Option<SwapChain> {
    let config = SwapChainConfig::default().with_targets(vec![backend]);
    match create_swap_chain(surface, config).await {
        Ok(swap_chain) => Some(swap_chain),
        // only WebGPU depends on the machine
        Err(e) if backend == BackendKind::WebGPU => {
            eprintln!("skipping {backend}: {e}");
            None
        }
        Err(e) => panic!("{backend} should always open: {e}"),
    }
}

async fn buffer_round_trip(backend: BackendKind) {
    let surface = HeadlessSurface::new(8, 8);
    let Some(mut swap_chain) = open(&surface, backend).await else {
        return;
    };
    let device = swap_chain.get_device();
    let values: Vec<u32> = (0..64).collect();
    let buffer = device
        .create_buffer(&BufferDescriptor::with_data(
            bytemuck::cast_slice(&values),
            BufferUsage::VERTEX | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        ))
        .unwrap();
    device
        .write_buffer(buffer, 16, bytemuck::cast_slice(&[99u32, 100]))
        .unwrap();

    let readback = device.create_readback();
    let all = readback.read_buffer(device, buffer).unwrap().await.unwrap();
    let all = all.to_vec::<u32>();
    assert_eq!(all.len(), 64);
    assert_eq!(&all[3..7], &[3, 99, 100, 6]);

    let tail = readback
        .read_buffer_range(device, buffer, 248, Some(8))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(tail.to_vec::<u32>(), vec![62, 63]);

    device.destroy(buffer).unwrap();
    assert!(device.check_for_leaks().is_empty());
}

async fn texture_round_trip(backend: BackendKind) {
    let surface = HeadlessSurface::new(8, 8);
    let Some(mut swap_chain) = open(&surface, backend).await else {
        return;
    };
    let device = swap_chain.get_device();
    let desc = TextureDescriptor::new_2d(
        TextureFormat::Rgba8Unorm,
        4,
        4,
        TextureUsage::SAMPLED | TextureUsage::RENDER_TARGET,
    );
    let texture = device.create_texture(&desc).unwrap();
    let texels: Vec<u8> = (0..64).map(|i| (i * 3) as u8).collect();
    device.write_texture(texture, 0, &texels).unwrap();

    let readback = device.create_readback();
    let data = readback
        .read_texture(device, texture, 0)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(data.as_bytes(), &texels[..]);

    // wrong length
    assert!(matches!(
        device.write_texture(texture, 0, &texels[..60]),
        Err(Error::InvalidDescriptor { .. })
    ));
    device.destroy(texture).unwrap();
    assert!(device.check_for_leaks().is_empty());
}

#[test_executors::async_test]
async fn software_round_trip() {
    buffer_round_trip(BackendKind::Software).await;
    texture_round_trip(BackendKind::Software).await;
}

#[test_executors::async_test]
async fn webgl1_round_trip() {
    buffer_round_trip(BackendKind::WebGL1).await;
    texture_round_trip(BackendKind::WebGL1).await;
}

#[test_executors::async_test]
async fn webgl2_round_trip() {
    buffer_round_trip(BackendKind::WebGL2).await;
    texture_round_trip(BackendKind::WebGL2).await;
}

#[test_executors::async_test]
async fn webgpu_round_trip() {
    buffer_round_trip(BackendKind::WebGPU).await;
    texture_round_trip(BackendKind::WebGPU).await;
}

#[test_executors::async_test]
async fn one_readback_per_resource() {
    let surface = HeadlessSurface::new(8, 8);
    let config = SwapChainConfig::default().with_targets(vec![BackendKind::WebGL2]);
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let device = swap_chain.get_device();
    let buffer = device
        .create_buffer(&BufferDescriptor::with_data(
            &[1, 2, 3, 4],
            BufferUsage::VERTEX | BufferUsage::COPY_SRC,
        ))
        .unwrap();
    let readback = device.create_readback();
    let first = readback.read_buffer(device, buffer).unwrap();
    assert!(matches!(
        readback.read_buffer(device, buffer),
        Err(Error::ResourceBusy(_))
    ));
    assert_eq!(first.await.unwrap().as_bytes(), &[1, 2, 3, 4]);

    // an abandoned readback frees the buffer too
    let abandoned = readback.read_buffer(device, buffer).unwrap();
    drop(abandoned);
    let again = readback.read_buffer(device, buffer).unwrap().await.unwrap();
    assert_eq!(again.len(), 4);
    device.destroy(buffer).unwrap();
}

#[test_executors::async_test]
async fn ranges_outside_the_buffer_are_rejected() {
    let surface = HeadlessSurface::new(8, 8);
    let config = SwapChainConfig::default().with_targets(vec![BackendKind::Software]);
    let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
    let device = swap_chain.get_device();
    let buffer = device
        .create_buffer(&BufferDescriptor::with_size(16, BufferUsage::COPY_SRC))
        .unwrap();
    let readback = device.create_readback();
    assert!(matches!(
        readback.read_buffer_range(device, buffer, 12, Some(8)),
        Err(Error::InvalidDescriptor { .. })
    ));
    assert!(matches!(
        device.write_buffer(buffer, 10, &[0; 8]),
        Err(Error::InvalidDescriptor { .. })
    ));
    // ends that do not fit in a u64
    assert!(matches!(
        device.write_buffer(buffer, u64::MAX, &[1, 2, 3, 4]),
        Err(Error::InvalidDescriptor { .. })
    ));
    assert!(matches!(
        readback.read_buffer_range(device, buffer, u64::MAX - 2, Some(8)),
        Err(Error::InvalidDescriptor { .. })
    ));
    assert!(matches!(
        readback.read_buffer_range(device, buffer, 4, Some(u64::MAX)),
        Err(Error::InvalidDescriptor { .. })
    ));
    device.destroy(buffer).unwrap();
}
