//! End-to-end scheduler and staging scenarios on the headless backend.

use grx::{
    BlasGeometry, BufferUsage, Device, DeviceFlags, Error, Format, Instance, ResourceFlags,
    RtasBuildFlags, TextureDesc, TextureType, TextureUsage,
};
use grx_backend_empty::{Backend, JournalOp};

fn device() -> (Instance<Backend>, Device<Backend>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let instance =
        Instance::<Backend>::create("grx-tests", 1, DeviceFlags::DEBUG).expect("instance");
    let info = instance.device_infos().expect("device infos")[0].clone();
    let device = Device::create(&instance, &info, DeviceFlags::DEBUG).expect("device");
    (instance, device)
}

fn empty_list(device: &Device<Backend>) -> grx::CommandList<Backend> {
    let list = device.create_command_list();
    list.begin().unwrap();
    list.end().unwrap();
    list
}

#[test]
fn device_lifecycle() {
    let (_instance, device) = device();
    assert_eq!(device.info().name, "empty");
    drop(device);
}

#[test]
fn host_visible_buffer_roundtrip() {
    let (_instance, device) = device();
    let buffer = device
        .create_buffer(
            BufferUsage::empty(),
            ResourceFlags::CPU_BACKED | ResourceFlags::CPU_ALLOCATED | ResourceFlags::SHADER_READ,
            "roundtrip",
            64,
        )
        .unwrap();

    let bytes: Vec<u8> = (0..64).collect();
    buffer.write(0, &bytes).unwrap();

    let list = empty_list(&device);
    device.submit(&[&list], &[], &[], -1.0, 0.0).unwrap();
    device.wait().unwrap();

    assert_eq!(buffer.read_mapped(0, 64).unwrap(), bytes);
}

#[test]
fn staging_ring_overflow_grows() {
    let (_instance, device) = device();
    let initial = device.staging_size();
    let slice = initial / 3;

    let mib = 1u64 << 20;
    let sizes = [6 * mib, 6 * mib, 10 * mib];
    let buffers: Vec<_> = sizes
        .iter()
        .map(|&size| {
            device
                .create_buffer_data(
                    BufferUsage::empty(),
                    ResourceFlags::SHADER_READ,
                    "upload",
                    vec![0x5A; size as usize],
                )
                .unwrap()
        })
        .collect();
    // 6 + 6 fits the 21.3 MiB slice, the third 10 MiB upload overflows it.
    assert!(sizes[0] + sizes[1] <= slice);
    assert!(sizes[0] + sizes[1] + sizes[2] > slice);

    let list = empty_list(&device);
    device.submit(&[&list], &[], &[], -1.0, 0.0).unwrap();

    assert!(
        device.staging_size() >= initial * 2 + 10 * mib * 3,
        "staging should have grown, got {}",
        device.staging_size()
    );

    let copied: u64 = device
        .raw()
        .journal()
        .iter()
        .filter_map(|op| match op {
            JournalOp::CopyBuffer { bytes, .. } => Some(*bytes),
            _ => None,
        })
        .sum();
    assert_eq!(copied, 22 * mib);
    drop(buffers);
}

#[test]
fn oversize_upload_takes_dedicated_staging() {
    let (_instance, device) = device();
    let size = 20u64 << 20;
    let buffer = device
        .create_buffer(
            BufferUsage::empty(),
            ResourceFlags::CPU_BACKED | ResourceFlags::CPU_ALLOCATED | ResourceFlags::SHADER_READ,
            "big upload",
            size,
        )
        .unwrap();

    // First frame writes through the mapping directly; the buffer is now
    // retained in the frame's in-flight list.
    buffer.write(0, &vec![1u8; size as usize]).unwrap();
    let list = empty_list(&device);
    device.submit(&[&list], &[], &[], -1.0, 0.0).unwrap();
    device.raw().clear_journal();

    // Second frame: the buffer is in flight, the 20 MiB upload exceeds a
    // quarter of the 64 MiB staging buffer, so a dedicated transient
    // staging buffer carries one coalesced GPU copy.
    buffer.write(0, &vec![9u8; size as usize]).unwrap();
    device.submit(&[&list], &[], &[], -1.0, 0.0).unwrap();

    let copies: Vec<_> = device
        .raw()
        .journal()
        .into_iter()
        .filter_map(|op| match op {
            JournalOp::CopyBuffer { regions, bytes } => Some((regions, bytes)),
            _ => None,
        })
        .collect();
    assert_eq!(copies, vec![(1, size)]);

    device.wait().unwrap();
    assert_eq!(buffer.read_mapped(0, 16).unwrap(), vec![9u8; 16]);
}

#[test]
fn texture_upload_records_image_copy() {
    let (_instance, device) = device();
    let desc = TextureDesc {
        ty: TextureType::D2,
        format: Format::Rgba8Unorm,
        width: 16,
        height: 16,
        depth_or_layers: 1,
        mips: 1,
        usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
    };
    let data = vec![0xCC; (16 * 16 * 4) as usize];
    let _texture = device
        .create_texture(desc, ResourceFlags::SHADER_READ, "checker", Some(data))
        .unwrap();

    let list = empty_list(&device);
    device.submit(&[&list], &[], &[], -1.0, 0.0).unwrap();

    let journal = device.raw().journal();
    assert!(journal
        .iter()
        .any(|op| matches!(op, JournalOp::CopyBufferToImage { regions: 1 })));
}

#[test]
fn descriptor_slots_are_reused_lowest_first() {
    let (_instance, device) = device();
    let desc = TextureDesc {
        ty: TextureType::D2,
        format: Format::Rgba8Unorm,
        width: 4,
        height: 4,
        depth_or_layers: 1,
        mips: 1,
        usage: TextureUsage::SAMPLED,
    };
    let textures: Vec<_> = (0..10)
        .map(|i| {
            device
                .create_texture(desc, ResourceFlags::SHADER_READ, &format!("t{}", i), None)
                .unwrap()
        })
        .collect();
    let first = textures[0].read_handle().index();
    let handles: Vec<_> = textures.iter().map(|t| t.read_handle().index()).collect();
    assert!(handles.windows(2).all(|w| w[1] > w[0]));

    drop(textures);
    let fresh = device
        .create_texture(desc, ResourceFlags::SHADER_READ, "fresh", None)
        .unwrap();
    assert_eq!(fresh.read_handle().index(), first);
}

#[test]
fn read_read_barrier_is_elided_across_scopes() {
    let (_instance, device) = device();
    let buffer = device
        .create_buffer(BufferUsage::empty(), ResourceFlags::SHADER_READ, "sb", 256)
        .unwrap();

    // Warm all three frame slots so the per-frame UBO transitions settle.
    let warmup = empty_list(&device);
    for _ in 0..3 {
        device.submit(&[&warmup], &[], &[], -1.0, 0.0).unwrap();
    }
    device.raw().clear_journal();

    let list = device.create_command_list();
    list.begin().unwrap();
    for _ in 0..2 {
        list.start_scope(vec![grx::Transition::buffer(
            &buffer,
            0..0,
            grx::TransitionType::ShaderRead,
            grx::StageHint::Compute,
        )])
        .unwrap();
        list.end_scope().unwrap();
    }
    list.end().unwrap();
    device.submit(&[&list], &[], &[], -1.0, 0.0).unwrap();

    let buffer_barriers: usize = device
        .raw()
        .journal()
        .iter()
        .filter_map(|op| match op {
            JournalOp::Barrier { buffers, .. } => Some(*buffers),
            _ => None,
        })
        .sum();
    assert_eq!(
        buffer_barriers, 1,
        "only the first read transition may emit a barrier"
    );
}

#[test]
fn blas_refit_reuses_structure_and_scratch() {
    let (_instance, device) = device();
    let positions = device
        .create_buffer_data(
            BufferUsage::AS_READ,
            ResourceFlags::empty(),
            "positions",
            vec![0; 9 * 4],
        )
        .unwrap();
    let blas = device
        .create_blas(
            BlasGeometry::Triangles {
                positions,
                position_format: Format::Rgb32Float,
                position_offset: 0,
                position_stride: 12,
                position_count: 3,
                indices: None,
            },
            RtasBuildFlags::ALLOW_UPDATE,
            None,
            "tri",
        )
        .unwrap();

    let list = empty_list(&device);
    device.submit(&[&list], &[], &[], -1.0, 0.0).unwrap();

    let builds: Vec<_> = device
        .raw()
        .journal()
        .into_iter()
        .filter(|op| matches!(op, JournalOp::BuildRtas { .. }))
        .collect();
    assert_eq!(builds.len(), 1);
    let (first_dst, first_scratch) = match &builds[0] {
        JournalOp::BuildRtas {
            refit: false,
            top_level: false,
            dst,
            scratch_size,
        } => (*dst, *scratch_size),
        other => panic!("unexpected first build {:?}", other),
    };
    assert!(blas.is_completed());

    device.raw().clear_journal();
    let update = device.create_command_list();
    update.begin().unwrap();
    update.update_blas(&blas).unwrap();
    update.end().unwrap();
    device.submit(&[&update], &[], &[], -1.0, 0.0).unwrap();

    let builds: Vec<_> = device
        .raw()
        .journal()
        .into_iter()
        .filter(|op| matches!(op, JournalOp::BuildRtas { .. }))
        .collect();
    assert_eq!(builds.len(), 1);
    match &builds[0] {
        JournalOp::BuildRtas {
            refit: true,
            dst,
            scratch_size,
            ..
        } => {
            assert_eq!(*dst, first_dst, "refit must target the same structure");
            assert_eq!(*scratch_size, first_scratch, "scratch must be retained");
        }
        other => panic!("unexpected refit build {:?}", other),
    }
}

#[test]
fn unindexed_triangle_count_floors() {
    let (_instance, device) = device();
    let positions = device
        .create_buffer_data(
            BufferUsage::AS_READ,
            ResourceFlags::empty(),
            "positions",
            vec![0; 10 * 12],
        )
        .unwrap();
    let blas = device
        .create_blas(
            BlasGeometry::Triangles {
                positions,
                position_format: Format::Rgb32Float,
                position_offset: 0,
                position_stride: 12,
                position_count: 10,
                indices: None,
            },
            RtasBuildFlags::empty(),
            None,
            "floor",
        )
        .unwrap();
    assert_eq!(blas.primitive_count(), 3);
}

#[test]
fn tlas_instance_count_is_bounded() {
    let (_instance, device) = device();
    let records = device
        .create_buffer(BufferUsage::AS_READ, ResourceFlags::empty(), "records", 64)
        .unwrap();
    let result = device.create_tlas(
        grx::TlasInstances::Device {
            buffer: records,
            offset: 0,
            count: 1 << 24,
            motion: false,
        },
        RtasBuildFlags::empty(),
        None,
        "too many",
    );
    assert!(matches!(result, Err(Error::OutOfBounds(_))));
}

#[test]
fn submit_validation() {
    let (_instance, device) = device();
    // Nothing to do.
    assert!(matches!(
        device.submit(&[], &[], &[], -1.0, 0.0),
        Err(Error::InvalidOperation(_))
    ));

    // Open command list.
    let open = device.create_command_list();
    open.begin().unwrap();
    assert!(matches!(
        device.submit(&[&open], &[], &[], -1.0, 0.0),
        Err(Error::InvalidParameter(_))
    ));
    open.end().unwrap();

    // App data over 368 bytes.
    let list = empty_list(&device);
    let too_big = vec![0u8; 369];
    assert!(matches!(
        device.submit(&[&list], &[], &too_big, -1.0, 0.0),
        Err(Error::InvalidParameter(_))
    ));
    let just_right = vec![0u8; 368];
    device
        .submit(&[&list], &[], &just_right, -1.0, 0.0)
        .unwrap();
}

#[test]
fn oversized_allocation_is_rejected() {
    let (_instance, device) = device();
    let max = device.info().limits.max_allocation_size;
    let result = device.create_buffer(
        BufferUsage::empty(),
        ResourceFlags::empty(),
        "too big",
        max + 1,
    );
    assert!(matches!(result, Err(Error::OutOfBounds(_))));
}

#[test]
fn frame_slots_drain_in_flight_resources() {
    let (_instance, device) = device();
    // A transient upload pins a fresh memory block while in flight.
    let buffer = device
        .create_buffer_data(
            BufferUsage::empty(),
            ResourceFlags::SHADER_READ,
            "transient",
            vec![1; 1024],
        )
        .unwrap();
    let list = empty_list(&device);
    device.submit(&[&list], &[], &[], -1.0, 0.0).unwrap();
    drop(buffer);

    let before = device.raw().live_memory_blocks();
    // Three more submits reuse the slot and release the dropped buffer.
    for _ in 0..3 {
        device.submit(&[&list], &[], &[], -1.0, 0.0).unwrap();
    }
    assert!(device.raw().live_memory_blocks() < before);
    device.wait().unwrap();
}

#[cfg(unix)]
mod swapchain {
    use super::*;
    use grx::{PresentMode, StageHint, Swapchain, SwapchainDesc, Transition, TransitionType,
        WindowHandle};

    fn window(size: (u32, u32)) -> WindowHandle {
        WindowHandle {
            raw: raw_window_handle::RawWindowHandle::Xlib(
                raw_window_handle::unix::XlibHandle::empty(),
            ),
            size,
        }
    }

    fn swapchain(device: &Device<Backend>) -> Swapchain<Backend> {
        device
            .create_swapchain(&window((640, 480)), SwapchainDesc::default())
            .unwrap()
    }

    #[test]
    fn version_increments_on_every_recreation() {
        let (_instance, device) = device();
        let swapchain = swapchain(&device);
        assert_eq!(swapchain.version(), 1);
        swapchain.resize(&window((800, 600))).unwrap();
        assert_eq!(swapchain.version(), 2);
        assert_eq!(swapchain.extent(), (800, 600));
        swapchain.resize(&window((1024, 768))).unwrap();
        assert_eq!(swapchain.version(), 3);
    }

    #[test]
    fn present_mode_priorities_are_honored() {
        let (_instance, device) = device();
        let desc = SwapchainDesc {
            present_mode_priorities: vec![PresentMode::FifoRelaxed, PresentMode::Immediate],
            ..SwapchainDesc::default()
        };
        let swapchain = device.create_swapchain(&window((64, 64)), desc).unwrap();
        // FifoRelaxed is unsupported; Immediate is next in line.
        assert_eq!(swapchain.present_mode(), PresentMode::Immediate);
    }

    #[test]
    fn stale_swapchain_capture_is_rejected() {
        let (_instance, device) = device();
        let swapchain = swapchain(&device);

        let list = device.create_command_list();
        list.begin().unwrap();
        list.start_scope(vec![Transition::swapchain(
            &swapchain,
            TransitionType::RenderTarget,
            StageHint::Fragment,
        )])
        .unwrap();
        list.end_scope().unwrap();
        list.end().unwrap();

        swapchain.resize(&window((320, 240))).unwrap();
        let result = device.submit(&[&list], &[&swapchain], &[], -1.0, 0.0);
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn present_submits_and_rotates_images() {
        let (_instance, device) = device();
        let swapchain = swapchain(&device);
        let list = empty_list(&device);
        for _ in 0..4 {
            device
                .submit(&[&list], &[&swapchain], &[], -1.0, 0.0)
                .unwrap();
        }
        let presents = device
            .raw()
            .journal()
            .iter()
            .filter(|op| matches!(op, JournalOp::Present { count: 1 }))
            .count();
        assert_eq!(presents, 4);
    }

    #[test]
    fn swapchain_submit_limit() {
        let (_instance, device) = device();
        let chains: Vec<_> = (0..17).map(|_| swapchain(&device)).collect();
        let refs: Vec<&Swapchain<Backend>> = chains.iter().collect();
        let list = empty_list(&device);
        assert!(matches!(
            device.submit(&[&list], &refs, &[], -1.0, 0.0),
            Err(Error::InvalidParameter(_))
        ));
        device
            .submit(&[&list], &refs[..16], &[], -1.0, 0.0)
            .unwrap();
    }
}
