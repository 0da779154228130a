use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use gfxbridge_wire::{CommandFlags, CommandHeader, Opcode};
use tracing::{debug, info, warn};

use crate::channel::{ChannelReader, ChannelWriter};
use crate::error::{ChannelError, Result};

/// How long one drain attempt blocks on the response channel before the
/// draining waiter re-checks deadlines and lets another thread take over.
const DRAIN_SLICE: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct PendingCall {
    response: Option<Bytes>,
}

#[derive(Debug, Default)]
struct AdapterState {
    pending: HashMap<u32, PendingCall>,
    draining: bool,
    poisoned: bool,
}

/// Layers request/response semantics over one outbound channel and its
/// inbound response channel.
///
/// Many application threads may have calls in flight at once. Each call
/// registers a pending entry keyed by a fresh correlation id, pushes its
/// command, and blocks until the matching response arrives or its deadline
/// passes. Whichever waiter gets there first drains the response channel
/// on behalf of everyone (there is exactly one consumer seat per channel);
/// the rest park on a condvar.
///
/// A response whose correlation id has no pending entry belonged to a call
/// that already timed out; it is discarded. A call that times out is an
/// *unknown outcome* — the worker may still execute the command later —
/// which is why timeouts never get retried here.
pub struct SyncCaller {
    writer: Mutex<ChannelWriter>,
    reader: Mutex<ChannelReader>,
    state: Mutex<AdapterState>,
    wakeup: Condvar,
    next_correlation: AtomicU32,
}

impl SyncCaller {
    pub fn new(writer: ChannelWriter, reader: ChannelReader) -> Self {
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            state: Mutex::new(AdapterState::default()),
            wakeup: Condvar::new(),
            next_correlation: AtomicU32::new(1),
        }
    }

    /// A fresh correlation id. Wraps, skipping 0 (0 marks fire-and-forget
    /// traffic in the header).
    fn mint_correlation(&self) -> u32 {
        loop {
            let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Push a command and block until the worker's response arrives.
    ///
    /// On `Timeout` the outcome of the command is unknown: it was pushed
    /// and cannot be withdrawn; only the wait is abandoned.
    pub fn send_and_wait(
        &self,
        mut header: CommandHeader,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Bytes> {
        let correlation = self.mint_correlation();
        header.correlation = correlation;
        header.flags = header.flags | CommandFlags::WANTS_RESPONSE;

        self.register(correlation)?;
        {
            let mut writer = self.writer.lock().expect("channel writer poisoned");
            if let Err(err) = writer.push_durable(header, payload) {
                self.abandon(correlation);
                return Err(err);
            }
        }
        self.wait_response(correlation, timeout)
    }

    /// Push a command that has no return value and move on.
    pub fn send_and_forget(&self, header: CommandHeader, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().expect("channel writer poisoned");
        writer.push_durable(header, payload)
    }

    /// Push an informational command that may be dropped under pressure.
    pub fn send_lossy(&self, header: CommandHeader, payload: &[u8]) -> Result<bool> {
        let mut writer = self.writer.lock().expect("channel writer poisoned");
        writer.push_lossy(header, payload)
    }

    /// Push a command whose caller tolerates a missing answer: waits like
    /// [`send_and_wait`] but yields `None` on timeout instead of an error,
    /// letting the call site substitute its legacy fallback value.
    ///
    /// [`send_and_wait`]: SyncCaller::send_and_wait
    pub fn send_optional_wait(
        &self,
        header: CommandHeader,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        match self.send_and_wait(header, payload, timeout) {
            Ok(response) => Ok(Some(response)),
            Err(ChannelError::Timeout(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Mark the adapter dead and wake every waiter with `Closed`. Called
    /// on fatal session errors and on worker exit.
    pub fn poison(&self) {
        let mut state = self.state.lock().expect("adapter state poisoned");
        state.poisoned = true;
        state.pending.clear();
        self.wakeup.notify_all();
    }

    /// Access the outbound writer, for pushes that bypass correlation
    /// tracking entirely (handshake, terminate, batched proxy commands).
    pub fn writer(&self) -> &Mutex<ChannelWriter> {
        &self.writer
    }

    /// Recent sent/received command history for the postmortem dump.
    pub fn history(&self, n: usize) -> (Vec<crate::HistoryEntry>, Vec<crate::HistoryEntry>) {
        let sent = self
            .writer
            .lock()
            .expect("channel writer poisoned")
            .recent_history(n);
        let received = self
            .reader
            .lock()
            .expect("channel reader poisoned")
            .recent_history(n);
        (sent, received)
    }

    fn register(&self, correlation: u32) -> Result<()> {
        let mut state = self.state.lock().expect("adapter state poisoned");
        if state.poisoned {
            return Err(ChannelError::Closed);
        }
        // At most one pending call per correlation id, ever. Ids wrap only
        // after 2^32 calls, far beyond any response lifetime.
        let prev = state.pending.insert(correlation, PendingCall::default());
        assert!(
            prev.is_none(),
            "correlation id {correlation} already pending"
        );
        Ok(())
    }

    fn abandon(&self, correlation: u32) {
        let mut state = self.state.lock().expect("adapter state poisoned");
        state.pending.remove(&correlation);
    }

    fn wait_response(&self, correlation: u32, timeout: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("adapter state poisoned");

        loop {
            if state.poisoned {
                state.pending.remove(&correlation);
                return Err(ChannelError::Closed);
            }
            if let Some(call) = state.pending.get_mut(&correlation) {
                if let Some(response) = call.response.take() {
                    state.pending.remove(&correlation);
                    return Ok(response);
                }
            }
            if Instant::now() >= deadline {
                // Leave no entry behind: a late response must be discarded
                // as an orphan, not delivered to a reused id.
                state.pending.remove(&correlation);
                debug!(correlation, "response wait timed out; outcome unknown");
                return Err(ChannelError::Timeout(timeout));
            }

            if state.draining {
                let (next, _timeout) = self
                    .wakeup
                    .wait_timeout(state, DRAIN_SLICE)
                    .expect("adapter state poisoned");
                state = next;
            } else {
                state.draining = true;
                drop(state);
                let drained = self.drain_once();
                state = self.state.lock().expect("adapter state poisoned");
                state.draining = false;
                match drained {
                    Ok(Some((resp_correlation, payload))) => {
                        match state.pending.get_mut(&resp_correlation) {
                            Some(call) => call.response = Some(payload),
                            None => {
                                debug!(
                                    correlation = resp_correlation,
                                    "discarding orphaned response (caller timed out)"
                                );
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) if err.is_fatal() => {
                        state.poisoned = true;
                        state.pending.clear();
                        self.wakeup.notify_all();
                        return Err(err);
                    }
                    Err(_) => {}
                }
                self.wakeup.notify_all();
            }
        }
    }

    /// Pop at most one message from the response channel. Returns the
    /// correlation id and payload for responses; handles stray traffic
    /// inline.
    fn drain_once(&self) -> Result<Option<(u32, Bytes)>> {
        let mut reader = self.reader.lock().expect("channel reader poisoned");
        match reader.try_pop(DRAIN_SLICE) {
            Ok(msg) => match msg.header.opcode {
                Opcode::Response => Ok(Some((msg.header.correlation, msg.payload))),
                Opcode::DebugMessage => {
                    info!(
                        message = %String::from_utf8_lossy(&msg.payload),
                        "worker debug message"
                    );
                    Ok(None)
                }
                other => {
                    warn!(opcode = other.name(), "unexpected message on response channel");
                    Ok(None)
                }
            },
            Err(ChannelError::Timeout(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for SyncCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCaller").finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gfxbridge_shm::SharedRegion;
    use gfxbridge_wire::{CommandFlags, PayloadReader, PayloadWriter};

    use super::*;
    use crate::channel::ChannelConfig;
    use crate::Message;

    fn small_config() -> ChannelConfig {
        ChannelConfig {
            cmd_capacity: 64,
            data_len: 64 * 1024,
            push_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_micros(50),
            history_len: 32,
        }
    }

    /// A caller endpoint plus the worker-side endpoints of both rings.
    fn harness() -> (Arc<SyncCaller>, ChannelReader, ChannelWriter) {
        let config = small_config();
        let out_region = Arc::new(SharedRegion::anonymous(config.region_len()).unwrap());
        let in_region = Arc::new(SharedRegion::anonymous(config.region_len()).unwrap());

        let caller = SyncCaller::new(
            ChannelWriter::new(Arc::clone(&out_region), &config, "dev.to_worker").unwrap(),
            ChannelReader::new(Arc::clone(&in_region), &config, "dev.to_client").unwrap(),
        );
        let worker_rx = ChannelReader::new(out_region, &config, "dev.to_worker").unwrap();
        let worker_tx = ChannelWriter::new(in_region, &config, "dev.to_client").unwrap();
        (Arc::new(caller), worker_rx, worker_tx)
    }

    fn request(opcode: Opcode) -> CommandHeader {
        CommandHeader {
            opcode,
            flags: CommandFlags::NONE,
            target: 1,
            correlation: 0,
            payload_size: 0,
            payload_offset: 0,
        }
    }

    fn respond_to(msg: &Message, worker_tx: &mut ChannelWriter, value: u32) {
        let mut payload = PayloadWriter::new();
        payload.put_i32(0).put_u32(value);
        let mut header = CommandHeader::control(Opcode::Response);
        header.correlation = msg.header.correlation;
        worker_tx
            .push_durable(header, &payload.finish())
            .unwrap();
    }

    /// Echo worker: responds to every request with its correlation-derived
    /// value, in arrival order.
    fn spawn_echo_worker(
        mut worker_rx: ChannelReader,
        mut worker_tx: ChannelWriter,
        count: usize,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for _ in 0..count {
                let msg = worker_rx.try_pop(Duration::from_secs(5)).unwrap();
                respond_to(&msg, &mut worker_tx, msg.header.correlation * 10);
            }
        })
    }

    #[test]
    fn send_and_wait_returns_matching_response() {
        let (caller, worker_rx, worker_tx) = harness();
        let worker = spawn_echo_worker(worker_rx, worker_tx, 1);

        let response = caller
            .send_and_wait(
                request(Opcode::DeviceGetAvailableMemory),
                &[],
                Duration::from_secs(2),
            )
            .unwrap();

        let mut reader = PayloadReader::new(response);
        assert_eq!(reader.get_i32().unwrap(), 0);
        assert_eq!(reader.get_u32().unwrap(), 10);
        reader.finish().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn correlation_never_cross_delivers_under_contention() {
        let (caller, worker_rx, worker_tx) = harness();
        const CALLERS: usize = 8;
        const PER_CALLER: usize = 25;
        let worker = spawn_echo_worker(worker_rx, worker_tx, CALLERS * PER_CALLER);

        let mut handles = Vec::new();
        for _ in 0..CALLERS {
            let caller = Arc::clone(&caller);
            handles.push(std::thread::spawn(move || {
                for _ in 0..PER_CALLER {
                    let response = caller
                        .send_and_wait(
                            request(Opcode::DeviceGetRenderState),
                            &[],
                            Duration::from_secs(5),
                        )
                        .unwrap();
                    let mut reader = PayloadReader::new(response);
                    reader.get_i32().unwrap();
                    reader.get_u32().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        worker.join().unwrap();
    }

    #[test]
    fn timeout_leaves_other_calls_unharmed() {
        let (caller, mut worker_rx, mut worker_tx) = harness();

        // Worker: swallow the first request entirely, answer the second.
        let worker = std::thread::spawn(move || {
            let first = worker_rx.try_pop(Duration::from_secs(5)).unwrap();
            let second = worker_rx.try_pop(Duration::from_secs(5)).unwrap();
            respond_to(&second, &mut worker_tx, 42);
            // Belatedly answer the first: by now its caller has timed out
            // and the response must be discarded as an orphan.
            respond_to(&first, &mut worker_tx, 99);
        });

        let err = caller
            .send_and_wait(
                request(Opcode::DeviceTestCooperativeLevel),
                &[],
                Duration::from_millis(50),
            )
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));

        let response = caller
            .send_and_wait(
                request(Opcode::DeviceGetAvailableMemory),
                &[],
                Duration::from_secs(5),
            )
            .unwrap();
        let mut reader = PayloadReader::new(response);
        reader.get_i32().unwrap();
        assert_eq!(reader.get_u32().unwrap(), 42);
        worker.join().unwrap();

        // The orphaned response for the first call must not surface later.
        let err = caller
            .send_and_wait(
                request(Opcode::DeviceGetAvailableMemory),
                &[],
                Duration::from_millis(50),
            )
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[test]
    fn optional_wait_yields_none_against_silent_worker() {
        let (caller, _worker_rx, _worker_tx) = harness();
        let start = Instant::now();
        let outcome = caller
            .send_optional_wait(
                request(Opcode::DeviceTestCooperativeLevel),
                &[],
                Duration::from_millis(10),
            )
            .unwrap();
        assert!(outcome.is_none());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn send_and_forget_does_not_track_correlation() {
        let (caller, mut worker_rx, _worker_tx) = harness();
        caller
            .send_and_forget(request(Opcode::DeviceClear), b"")
            .unwrap();
        let msg = worker_rx.try_pop(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.header.correlation, 0);
    }

    #[test]
    fn poison_wakes_waiters_with_closed() {
        let (caller, _worker_rx, _worker_tx) = harness();
        let waiter = {
            let caller = Arc::clone(&caller);
            std::thread::spawn(move || {
                caller.send_and_wait(
                    request(Opcode::DeviceGetAvailableMemory),
                    &[],
                    Duration::from_secs(30),
                )
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        caller.poison();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));

        // New calls fail fast once poisoned.
        let err = caller
            .send_and_wait(request(Opcode::DeviceClear), &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }
}
