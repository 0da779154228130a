use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use gfxbridge_channel::{
    ChannelError, ChannelReader, ChannelWriter, HistoryEntry, SyncCaller,
};
use gfxbridge_heap::{AllocId, SharedHeap};
use gfxbridge_shm::{NamedSemaphore, SharedRegion, WorkerProcess};
use gfxbridge_wire::{CommandHeader, IdFactory, Opcode, PayloadWriter};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::handshake::handshake_client;
use crate::options::BridgeOptions;
use crate::pacer::FramePacer;
use crate::proxy::ModuleProxy;
use gfxbridge_wire::{LegacyResult, LegacyStatus};

/// The interceptor's bridge session: every component the proxies need,
/// with one init and one teardown path.
///
/// Owns the two channel pairs (device and module), the synchronous-call
/// adapters over them, the bulk data arena, the frame pacer, and the
/// worker process handle. There are no free-standing globals; proxies hold
/// an `Arc<BridgeSession>` and everything dies together.
///
/// Teardown ordering: the running flag is cleared first (new calls fail
/// fast with `DEVICE_LOST`), then the adapters are poisoned (blocked
/// waiters wake), then diagnostics are dumped once. The worker process, if
/// this session spawned one, is killed last.
pub struct BridgeSession {
    options: BridgeOptions,
    ids: IdFactory,
    running: AtomicBool,
    diagnostics_dumped: AtomicBool,
    device: SyncCaller,
    module: SyncCaller,
    heap: Option<SharedHeap>,
    pacer: Option<FramePacer>,
    worker: Mutex<Option<WorkerProcess>>,
}

impl BridgeSession {
    /// Full startup: create the shared regions and semaphore, spawn the
    /// worker, run the handshake, and assemble the session.
    ///
    /// The worker process resolves its own copy of the options from the
    /// inherited environment, so both sides compute identical channel
    /// geometry.
    pub fn launch(options: BridgeOptions) -> Result<Arc<Self>> {
        let base = format!("{}-{}", options.channel_base_name, std::process::id());
        let device_config = options.device_channel_config();
        let module_config = options.module_channel_config();

        let dev_c2w = Arc::new(SharedRegion::create(
            &format!("{base}-dev-c2w"),
            device_config.region_len(),
        )?);
        let dev_w2c = Arc::new(SharedRegion::create(
            &format!("{base}-dev-w2c"),
            device_config.region_len(),
        )?);
        let mod_c2w = Arc::new(SharedRegion::create(
            &format!("{base}-mod-c2w"),
            module_config.region_len(),
        )?);
        let mod_w2c = Arc::new(SharedRegion::create(
            &format!("{base}-mod-w2c"),
            module_config.region_len(),
        )?);

        let heap = if options.shared_heap_enabled {
            let region = Arc::new(SharedRegion::create(
                &format!("{base}-heap"),
                options.shared_heap_len,
            )?);
            Some(SharedHeap::new(region, SharedHeap::DEFAULT_CHUNK_LEN)?)
        } else {
            None
        };

        let pacer = if options.frame_pacing_enabled {
            let sem = NamedSemaphore::create(
                &format!("{base}-present"),
                options.max_frames_ahead,
            )?;
            Some(FramePacer::new(
                sem,
                std::time::Duration::from_millis(options.push_timeout_ms),
            ))
        } else {
            None
        };

        let worker = WorkerProcess::spawn(
            &options.worker_program,
            &["--channel-base".to_string(), base.clone()],
        )?;

        let mut mod_writer = ChannelWriter::new(Arc::clone(&mod_c2w), &module_config, "module.to_worker")?;
        let mut mod_reader = ChannelReader::new(Arc::clone(&mod_w2c), &module_config, "module.to_client")?;
        handshake_client(&mut mod_writer, &mut mod_reader, options.startup_timeout())?;

        let device = SyncCaller::new(
            ChannelWriter::new(dev_c2w, &device_config, "device.to_worker")?,
            ChannelReader::new(dev_w2c, &device_config, "device.to_client")?,
        );
        let module = SyncCaller::new(mod_writer, mod_reader);

        let session = Self::from_parts(options, device, module, heap, pacer);
        session.attach_worker(worker);
        info!(%base, "bridge session established");
        Ok(session)
    }

    /// Assemble a session from pre-built parts. Used by `launch` and by
    /// in-process test harnesses that run the worker loop on a thread.
    pub fn from_parts(
        options: BridgeOptions,
        device: SyncCaller,
        module: SyncCaller,
        heap: Option<SharedHeap>,
        pacer: Option<FramePacer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            ids: IdFactory::new(),
            running: AtomicBool::new(true),
            diagnostics_dumped: AtomicBool::new(false),
            device,
            module,
            heap,
            pacer,
            worker: Mutex::new(None),
        })
    }

    /// Adopt the spawned worker and poison the session the moment it
    /// exits: a bridge without its worker cannot continue.
    pub fn attach_worker(self: &Arc<Self>, worker: WorkerProcess) {
        let weak = Arc::downgrade(self);
        worker.on_exit(move |code| {
            if let Some(session) = weak.upgrade() {
                session.poison(&format!("worker process exited (code {code:?})"));
            }
        });
        *self.worker.lock().expect("worker slot poisoned") = Some(worker);
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    pub fn ids(&self) -> &IdFactory {
        &self.ids
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn device_caller(&self) -> &SyncCaller {
        &self.device
    }

    pub(crate) fn module_caller(&self) -> &SyncCaller {
        &self.module
    }

    /// Fatal-path teardown: stop accepting calls, wake waiters, dump the
    /// diagnostic history once, kill the worker.
    pub fn poison(&self, reason: &str) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        error!(reason, "bridge session poisoned");
        self.device.poison();
        self.module.poison();
        self.dump_diagnostics();
        if let Some(worker) = self.worker.lock().expect("worker slot poisoned").as_ref() {
            worker.kill();
        }
    }

    /// Clean shutdown: notify the worker, then stop.
    pub fn terminate(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("terminating bridge session");
        for caller in [&self.device, &self.module] {
            let mut writer = caller.writer().lock().expect("channel writer poisoned");
            if let Err(err) = writer.push_durable(CommandHeader::control(Opcode::Terminate), &[]) {
                warn!(%err, channel = writer.name(), "failed to send terminate notice");
            }
        }
        self.device.poison();
        self.module.poison();
    }

    /// Serialize the recent command history of both channel pairs through
    /// the log, once per session. Postmortem aid for abnormal shutdown.
    pub fn dump_diagnostics(&self) {
        if self.diagnostics_dumped.swap(true, Ordering::AcqRel) {
            return;
        }
        let n = self.options.history_len;
        let (device_sent, device_received) = self.device.history(n);
        let (module_sent, module_received) = self.module.history(n);
        let dump = serde_json::json!({
            "device": { "sent": entries_json(&device_sent), "received": entries_json(&device_received) },
            "module": { "sent": entries_json(&module_sent), "received": entries_json(&module_received) },
        });
        error!(history = %dump, "bridge command history");
    }

    /// Frame pacing gate, taken before each present. A pacing failure
    /// means the worker stopped consuming frames; that is fatal.
    pub(crate) fn acquire_frame(&self) -> bool {
        match &self.pacer {
            Some(pacer) => {
                if pacer.acquire_frame() {
                    true
                } else {
                    self.poison("worker stopped consuming frames");
                    false
                }
            }
            None => true,
        }
    }

    /// Allocate in the bulk arena and announce the placement to the
    /// worker. `None` means the arena is disabled or exhausted; callers
    /// fall back to inline transfer.
    pub(crate) fn heap_allocate(&self, len: usize) -> Option<AllocId> {
        let heap = self.heap.as_ref()?;
        let id = heap.allocate(len)?;
        let placement = heap.resolve(id).ok()?;
        let mut payload = PayloadWriter::new();
        payload
            .put_u32(id.0)
            .put_u64(placement.byte_offset as u64)
            .put_u64(placement.byte_len as u64);
        let header = CommandHeader::control(Opcode::HeapAlloc);
        match self.device.send_and_forget(header, &payload.finish()) {
            Ok(()) => Some(id),
            Err(err) => {
                warn!(%err, "failed to announce bulk allocation; falling back to inline");
                heap.deallocate(id);
                None
            }
        }
    }

    /// Free a bulk allocation and tell the worker to forget it.
    pub(crate) fn heap_free(&self, id: AllocId) {
        let Some(heap) = self.heap.as_ref() else {
            return;
        };
        let mut payload = PayloadWriter::new();
        payload.put_u32(id.0);
        let header = CommandHeader::control(Opcode::HeapFree);
        if let Err(err) = self.device.send_and_forget(header, &payload.finish()) {
            warn!(%err, "failed to announce bulk free");
        }
        heap.deallocate(id);
    }

    pub(crate) fn heap(&self) -> Option<&SharedHeap> {
        self.heap.as_ref()
    }

    /// Create the top-level interface proxy.
    pub fn create_module(self: &Arc<Self>) -> LegacyResult<Arc<ModuleProxy>> {
        self.ensure_running()?;
        ModuleProxy::new(Arc::clone(self))
    }

    pub(crate) fn ensure_running(&self) -> LegacyResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(LegacyStatus::DEVICE_LOST)
        }
    }

    /// Translate a channel error at the proxy boundary, poisoning the
    /// session for the fatal class.
    pub(crate) fn map_channel_error(&self, err: ChannelError) -> LegacyStatus {
        if err.is_fatal() {
            self.poison(&err.to_string());
            return LegacyStatus::DEVICE_LOST;
        }
        match err {
            // Unknown outcome: the most conservative legacy mapping.
            ChannelError::Timeout(_) => LegacyStatus::DEVICE_LOST,
            ChannelError::Full => LegacyStatus::NOT_AVAILABLE,
            _ => LegacyStatus::DEVICE_LOST,
        }
    }

    /// Fire-and-forget a durable command.
    pub(crate) fn forget(
        &self,
        caller: &SyncCaller,
        header: CommandHeader,
        payload: &[u8],
    ) -> LegacyResult<()> {
        self.ensure_running()?;
        caller
            .send_and_forget(header, payload)
            .map_err(|err| self.map_channel_error(err))
    }

    /// Send a command and block for its response.
    pub(crate) fn query(
        &self,
        caller: &SyncCaller,
        header: CommandHeader,
        payload: &[u8],
    ) -> LegacyResult<Bytes> {
        self.ensure_running()?;
        caller
            .send_and_wait(header, payload, self.options.ack_timeout())
            .map_err(|err| self.map_channel_error(err))
    }

    /// Send a command whose caller tolerates a missing answer. `None`
    /// means the wait timed out and the call site should substitute its
    /// legacy fallback value.
    pub(crate) fn query_optional(
        &self,
        caller: &SyncCaller,
        header: CommandHeader,
        payload: &[u8],
    ) -> LegacyResult<Option<Bytes>> {
        self.ensure_running()?;
        caller
            .send_optional_wait(header, payload, self.options.ack_timeout())
            .map_err(|err| self.map_channel_error(err))
    }
}

impl std::fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSession")
            .field("running", &self.is_running())
            .field("heap", &self.heap.is_some())
            .field("pacer", &self.pacer.is_some())
            .finish()
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.terminate();
        }
    }
}

fn entries_json(entries: &[HistoryEntry]) -> Vec<serde_json::Value> {
    entries
        .iter()
        .map(|entry| {
            serde_json::json!({
                "opcode": entry.opcode.name(),
                "target": entry.target,
                "correlation": entry.correlation,
            })
        })
        .collect()
}
