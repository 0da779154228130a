//! End-to-end tests: a real client session against a real worker loop
//! running on a thread, over anonymous shared memory.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use gfxbridge::channel::{ChannelReader, ChannelWriter, SyncCaller};
use gfxbridge::client::proxy::{
    CapabilityKind, CapabilityRef, Container, ProxyObject,
};
use gfxbridge::client::{
    handshake_client, BridgeOptions, BridgeSession, FramePacer, LegacyStatus,
};
use gfxbridge::heap::{HeapView, SharedHeap};
use gfxbridge::server::{handshake_server, NullEngine, Worker, WorkerChannels, WorkerObject};
use gfxbridge::shm::{NamedSemaphore, SharedRegion};
use gfxbridge::wire::{BufferDesc, DeviceDesc, LockFlags, Rect, TextureDesc};

static HARNESS_SEQ: AtomicU32 = AtomicU32::new(0);

struct Harness {
    session: Arc<BridgeSession>,
    worker: JoinHandle<(Worker<NullEngine>, gfxbridge::server::Result<()>)>,
}

impl Harness {
    /// Terminate the session and hand back the worker with its engine
    /// and registry for inspection.
    fn finish(self) -> Worker<NullEngine> {
        self.session.terminate();
        let (worker, result) = self.worker.join().expect("worker thread panicked");
        result.expect("worker loop failed");
        worker
    }
}

fn test_options() -> BridgeOptions {
    BridgeOptions {
        device_cmd_capacity: 256,
        device_data_len: 4 * 1024 * 1024,
        module_cmd_capacity: 64,
        module_data_len: 256 * 1024,
        ack_timeout_ms: 5000,
        startup_timeout_ms: 5000,
        push_timeout_ms: 5000,
        shared_heap_len: 8 * 1024 * 1024,
        max_frames_ahead: 2,
        ..BridgeOptions::default()
    }
}

fn start(options: BridgeOptions, engine: NullEngine) -> Harness {
    let device_config = options.device_channel_config();
    let module_config = options.module_channel_config();

    let dev_c2w = Arc::new(SharedRegion::anonymous(device_config.region_len()).unwrap());
    let dev_w2c = Arc::new(SharedRegion::anonymous(device_config.region_len()).unwrap());
    let mod_c2w = Arc::new(SharedRegion::anonymous(module_config.region_len()).unwrap());
    let mod_w2c = Arc::new(SharedRegion::anonymous(module_config.region_len()).unwrap());

    let heap_region = if options.shared_heap_enabled {
        Some(Arc::new(
            SharedRegion::anonymous(options.shared_heap_len).unwrap(),
        ))
    } else {
        None
    };
    let heap = heap_region
        .as_ref()
        .map(|region| SharedHeap::new(Arc::clone(region), SharedHeap::DEFAULT_CHUNK_LEN).unwrap());
    let heap_view = heap_region.as_ref().map(|region| HeapView::new(Arc::clone(region)));

    let (pacer, worker_sem) = if options.frame_pacing_enabled {
        let name = format!(
            "gfxbridge-it-{}-{}",
            std::process::id(),
            HARNESS_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let client_sem = NamedSemaphore::create(&name, options.max_frames_ahead).unwrap();
        let worker_sem = NamedSemaphore::open(&name).unwrap();
        (
            Some(FramePacer::new(
                client_sem,
                std::time::Duration::from_millis(options.push_timeout_ms),
            )),
            Some(worker_sem),
        )
    } else {
        (None, None)
    };

    let mut worker_channels = WorkerChannels {
        device_rx: ChannelReader::new(Arc::clone(&dev_c2w), &device_config, "device.to_worker")
            .unwrap(),
        device_tx: ChannelWriter::new(Arc::clone(&dev_w2c), &device_config, "device.to_client")
            .unwrap(),
        module_rx: ChannelReader::new(Arc::clone(&mod_c2w), &module_config, "module.to_worker")
            .unwrap(),
        module_tx: ChannelWriter::new(Arc::clone(&mod_w2c), &module_config, "module.to_client")
            .unwrap(),
    };

    let startup = options.startup_timeout();
    let worker = std::thread::spawn(move || {
        handshake_server(
            &mut worker_channels.module_rx,
            &mut worker_channels.module_tx,
            startup,
        )
        .expect("worker handshake failed");
        let mut worker = Worker::new(engine, heap_view, worker_sem);
        let result = worker.run(&mut worker_channels);
        (worker, result)
    });

    let mut mod_writer = ChannelWriter::new(mod_c2w, &module_config, "module.to_worker").unwrap();
    let mut mod_reader = ChannelReader::new(mod_w2c, &module_config, "module.to_client").unwrap();
    handshake_client(&mut mod_writer, &mut mod_reader, startup).expect("client handshake failed");

    let device = SyncCaller::new(
        ChannelWriter::new(dev_c2w, &device_config, "device.to_worker").unwrap(),
        ChannelReader::new(dev_w2c, &device_config, "device.to_client").unwrap(),
    );
    let module = SyncCaller::new(mod_writer, mod_reader);
    let session = BridgeSession::from_parts(options, device, module, heap, pacer);

    Harness { session, worker }
}

/// A session with no worker at all: nothing ever drains the channels or
/// answers queries.
fn start_silent(options: BridgeOptions) -> Arc<BridgeSession> {
    let device_config = options.device_channel_config();
    let module_config = options.module_channel_config();

    let dev_c2w = Arc::new(SharedRegion::anonymous(device_config.region_len()).unwrap());
    let dev_w2c = Arc::new(SharedRegion::anonymous(device_config.region_len()).unwrap());
    let mod_c2w = Arc::new(SharedRegion::anonymous(module_config.region_len()).unwrap());
    let mod_w2c = Arc::new(SharedRegion::anonymous(module_config.region_len()).unwrap());

    let device = SyncCaller::new(
        ChannelWriter::new(dev_c2w, &device_config, "device.to_worker").unwrap(),
        ChannelReader::new(dev_w2c, &device_config, "device.to_client").unwrap(),
    );
    let module = SyncCaller::new(
        ChannelWriter::new(mod_c2w, &module_config, "module.to_worker").unwrap(),
        ChannelReader::new(mod_w2c, &module_config, "module.to_client").unwrap(),
    );
    BridgeSession::from_parts(options, device, module, None, None)
}

fn test_device_desc() -> DeviceDesc {
    DeviceDesc {
        width: 640,
        height: 480,
        back_buffers: 2,
        windowed: true,
    }
}

#[test]
fn basic_query_round_trip() {
    let harness = start(
        test_options(),
        NullEngine {
            available_memory: 42,
            ..NullEngine::default()
        },
    );

    let module = harness.session.create_module().unwrap();
    assert_eq!(module.adapter_count().unwrap(), 1);

    let device = module.create_device(test_device_desc()).unwrap();
    assert_eq!(device.available_memory().unwrap(), 42);

    let worker = harness.finish();
    assert_eq!(worker.engine().devices_created, 1);
}

#[test]
fn draw_sequence_reaches_engine_in_order() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();

    assert!(device.begin_scene().is_ok());
    assert!(device.clear(1, 0xFF00_00FF, 1.0, 0).is_ok());
    assert!(device.set_render_state(7, 1).is_ok());
    for i in 0..16 {
        assert!(device.draw_primitive(4, i * 3, 1).is_ok());
    }
    assert!(device.end_scene().is_ok());

    // The mirror answers locally without a worker round trip.
    assert_eq!(device.get_render_state(7).unwrap(), 1);
    // An unmirrored state is answered by the worker (default 0).
    assert_eq!(device.get_render_state(99).unwrap(), 0);

    let worker = harness.finish();
    assert_eq!(worker.engine().draws, 16);
    assert_eq!(worker.engine().clears, 1);
}

#[test]
fn child_identity_is_stable_and_allocated_once() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();

    let texture = device
        .create_texture(TextureDesc {
            width: 64,
            height: 64,
            levels: 4,
            format: 21,
            usage: 0,
        })
        .unwrap();

    let first = texture.get_surface_level(2).unwrap();
    let second = texture.get_surface_level(2).unwrap();
    assert_eq!(first.object_id(), second.object_id());
    assert_eq!(first.extent(), (16, 16));

    // The container capability resolves to the same cached child.
    let Some(CapabilityRef::Container(container)) =
        texture.query_capability(CapabilityKind::Container)
    else {
        panic!("texture must expose the container capability");
    };
    assert_eq!(container.child_count(), 4);
    assert_eq!(
        container.child_at(2).unwrap().object_id(),
        first.object_id()
    );

    let worker = harness.finish();
    // Exactly one worker-side surface exists: module-less registry holds
    // device + texture + one surface.
    let surfaces = (1..=16)
        .filter(|&h| {
            matches!(
                worker.registry().get(h),
                Ok(WorkerObject::Surface { .. })
            )
        })
        .count();
    assert_eq!(surfaces, 1);
}

#[test]
fn surface_unlock_transfers_pixels() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();
    let texture = device
        .create_texture(TextureDesc {
            width: 8,
            height: 8,
            levels: 1,
            format: 21,
            usage: 0,
        })
        .unwrap();
    let surface = texture.get_surface_level(0).unwrap();
    let surface_handle = surface.object_id().wire_handle().unwrap();

    {
        let mut guard = surface
            .lock(
                Some(Rect {
                    x: 0,
                    y: 0,
                    width: 8,
                    height: 2,
                }),
                LockFlags::NONE,
            )
            .unwrap();
        let pitch = guard.pitch() as usize;
        guard.bytes_mut()[..2 * pitch].fill(0xAB);
    }
    assert!(surface.unlock().is_ok());

    let worker = harness.finish();
    assert_eq!(worker.engine().surface_bytes_uploaded, 8 * 2 * 4);
    match worker.registry().get(surface_handle).unwrap() {
        WorkerObject::Surface { data, .. } => {
            assert!(data[..8 * 2 * 4].iter().all(|&b| b == 0xAB));
            assert!(data[8 * 2 * 4..].iter().all(|&b| b == 0));
        }
        other => panic!("expected surface, got {other:?}"),
    }
}

#[test]
fn buffer_unlock_travels_through_bulk_arena() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();
    let buffer = device
        .create_buffer(BufferDesc {
            len: 128 * 1024,
            usage: 0,
            dynamic: true,
        })
        .unwrap();
    let buffer_handle = buffer.object_id().wire_handle().unwrap();

    {
        let mut guard = buffer.lock(4096, 1024, LockFlags::NONE).unwrap();
        guard.fill(0x5C);
    }
    assert!(buffer.unlock().is_ok());

    let worker = harness.finish();
    assert_eq!(worker.engine().buffer_bytes_uploaded, 1024);
    match worker.registry().get(buffer_handle).unwrap() {
        WorkerObject::Buffer { data, .. } => {
            assert!(data[4096..4096 + 1024].iter().all(|&b| b == 0x5C));
            assert!(data[..4096].iter().all(|&b| b == 0));
        }
        other => panic!("expected buffer, got {other:?}"),
    }
}

#[test]
fn defensive_unlock_is_silent_and_emits_nothing() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();
    let buffer = device
        .create_buffer(BufferDesc {
            len: 256,
            usage: 0,
            dynamic: false,
        })
        .unwrap();

    // No lock outstanding: both unlocks must be quiet no-ops.
    assert_eq!(buffer.unlock(), LegacyStatus::OK);
    assert_eq!(buffer.unlock(), LegacyStatus::OK);

    let worker = harness.finish();
    assert_eq!(worker.engine().buffer_bytes_uploaded, 0);
}

#[test]
fn read_only_unlock_transmits_nothing() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();
    let buffer = device
        .create_buffer(BufferDesc {
            len: 256,
            usage: 0,
            dynamic: false,
        })
        .unwrap();

    {
        let _guard = buffer.lock(0, 0, LockFlags::READ_ONLY).unwrap();
    }
    assert_eq!(buffer.unlock(), LegacyStatus::OK);

    let worker = harness.finish();
    assert_eq!(worker.engine().buffer_bytes_uploaded, 0);
}

#[test]
fn out_of_order_unlocks_retire_oldest_first() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();
    let buffer = device
        .create_buffer(BufferDesc {
            len: 4096,
            usage: 0,
            dynamic: true,
        })
        .unwrap();
    let buffer_handle = buffer.object_id().wire_handle().unwrap();

    {
        let mut guard = buffer.lock(0, 16, LockFlags::NONE).unwrap();
        guard.fill(0x11);
    }
    {
        let mut guard = buffer.lock(1024, 16, LockFlags::NONE).unwrap();
        guard.fill(0x22);
    }
    // Two unlocks retire the oldest lock first, then the next.
    assert_eq!(buffer.unlock(), LegacyStatus::OK);
    assert_eq!(buffer.unlock(), LegacyStatus::OK);

    let worker = harness.finish();
    match worker.registry().get(buffer_handle).unwrap() {
        WorkerObject::Buffer { data, .. } => {
            assert!(data[0..16].iter().all(|&b| b == 0x11));
            assert!(data[1024..1040].iter().all(|&b| b == 0x22));
        }
        other => panic!("expected buffer, got {other:?}"),
    }
}

#[test]
fn frame_pacing_allows_steady_presents() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();

    // More presents than the frames-ahead budget: the worker's posts
    // keep the pacer flowing.
    for _ in 0..6 {
        assert_eq!(device.present(), LegacyStatus::OK);
    }

    let worker = harness.finish();
    assert_eq!(worker.engine().presents, 6);
}

#[test]
fn swap_chain_children_are_cached_by_index() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();

    let swap_chain = device.get_swap_chain().unwrap();
    let again = device.get_swap_chain().unwrap();
    assert_eq!(swap_chain.object_id(), again.object_id());

    let bb0 = swap_chain.get_back_buffer(0).unwrap();
    let bb0_again = swap_chain.get_back_buffer(0).unwrap();
    assert_eq!(bb0.object_id(), bb0_again.object_id());
    assert!(swap_chain.get_back_buffer(5).is_err());

    assert_eq!(swap_chain.present(), LegacyStatus::OK);
    let worker = harness.finish();
    assert_eq!(worker.engine().presents, 1);
}

#[test]
fn texture_release_unlinks_children_on_worker() {
    let harness = start(test_options(), NullEngine::default());
    let module = harness.session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();
    let texture = device
        .create_texture(TextureDesc {
            width: 32,
            height: 32,
            levels: 2,
            format: 21,
            usage: 0,
        })
        .unwrap();
    let texture_handle = texture.object_id().wire_handle().unwrap();
    let surface = texture.get_surface_level(0).unwrap();
    let surface_handle = surface.object_id().wire_handle().unwrap();

    assert_eq!(surface.release(), 0);
    // Texture holds the only remaining external reference.
    assert_eq!(texture.release(), 0);
    assert!(surface.is_orphaned());

    let worker = harness.finish();
    assert!(worker.registry().get(texture_handle).is_err());
    assert!(worker.registry().get(surface_handle).is_err());
    // Only the texture was destroyed; the child was unlinked.
    assert_eq!(worker.engine().objects_destroyed, 1);
}

#[test]
fn optional_calls_fall_back_against_silent_worker() {
    let options = BridgeOptions {
        ack_timeout_ms: 50,
        ..test_options()
    };
    let session = start_silent(options);
    let module = session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();

    let start = std::time::Instant::now();
    // Nothing will ever answer: the fallback values come back after the
    // short ack timeout instead of an error.
    assert!(module.check_format(21).unwrap());
    assert_eq!(device.test_cooperative_level(), LegacyStatus::OK);
    assert!(start.elapsed() < std::time::Duration::from_secs(2));

    // A call that requires an answer reports the conservative status.
    assert_eq!(
        device.available_memory().unwrap_err(),
        LegacyStatus::DEVICE_LOST
    );
}

#[test]
fn poisoned_session_fails_fast_with_device_lost() {
    let session = start_silent(test_options());
    let module = session.create_module().unwrap();
    let device = module.create_device(test_device_desc()).unwrap();

    session.poison("test-induced failure");

    assert_eq!(device.present(), LegacyStatus::DEVICE_LOST);
    assert_eq!(device.clear(0, 0, 0.0, 0), LegacyStatus::DEVICE_LOST);
    assert_eq!(
        module.create_device(test_device_desc()).unwrap_err(),
        LegacyStatus::DEVICE_LOST
    );
}
