use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gfxbridge_shm::SharedRegion;
use gfxbridge_wire::{CommandFlags, CommandHeader, Opcode};
use tracing::warn;

use crate::error::Result;
use crate::ring::{Message, RingLayout, RingReader, RingWriter};
use crate::ChannelError;

/// Tuning for one channel direction.
///
/// Two pairs of channels exist per session: the high-frequency `device`
/// pair (per-draw traffic) and the low-frequency `module` pair (bootstrap
/// and top-level interface traffic), so bootstrap replies never queue
/// behind draw commands.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Command ring capacity in slots.
    pub cmd_capacity: u64,
    /// Data ring size in bytes.
    pub data_len: usize,
    /// Long safety timeout for durable pushes. Exceeding it means the
    /// consumer stopped draining; the session treats that as fatal.
    pub push_timeout: Duration,
    /// Sleep interval while spinning on a full or empty ring.
    pub poll_interval: Duration,
    /// How many recent commands to keep for postmortem dumps.
    pub history_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            cmd_capacity: 4096,
            data_len: 16 * 1024 * 1024,
            push_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_micros(50),
            history_len: 128,
        }
    }
}

impl ChannelConfig {
    /// A small geometry for the module/bootstrap channel.
    pub fn module_default() -> Self {
        Self {
            cmd_capacity: 256,
            data_len: 1024 * 1024,
            ..Self::default()
        }
    }

    pub fn layout(&self) -> RingLayout {
        RingLayout {
            cmd_capacity: self.cmd_capacity,
            data_len: self.data_len,
        }
    }

    /// Shared region bytes this configuration needs.
    pub fn region_len(&self) -> usize {
        self.layout().region_len()
    }
}

/// One entry of the bounded per-channel command history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub opcode: Opcode,
    pub target: u32,
    pub correlation: u32,
}

impl std::fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} target=#{} corr={}",
            self.opcode.name(),
            self.target,
            self.correlation
        )
    }
}

#[derive(Debug)]
struct History {
    entries: Mutex<VecDeque<HistoryEntry>>,
    cap: usize,
}

impl History {
    fn new(cap: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    fn record(&self, header: &CommandHeader) {
        if self.cap == 0 {
            return;
        }
        let mut entries = self.entries.lock().expect("history poisoned");
        if entries.len() == self.cap {
            entries.pop_front();
        }
        entries.push_back(HistoryEntry {
            opcode: header.opcode,
            target: header.target,
            correlation: header.correlation,
        });
    }

    fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().expect("history poisoned");
        entries.iter().rev().take(n).rev().copied().collect()
    }
}

/// Producer endpoint of one channel direction.
///
/// Pushes are durable by default (block until space frees, bounded by the
/// safety timeout); purely informational commands use [`push_lossy`] and
/// are dropped with a warning when the ring is full.
///
/// [`push_lossy`]: ChannelWriter::push_lossy
pub struct ChannelWriter {
    ring: RingWriter,
    name: String,
    push_timeout: Duration,
    history: History,
}

impl ChannelWriter {
    pub fn new(region: Arc<SharedRegion>, config: &ChannelConfig, name: &str) -> Result<Self> {
        Ok(Self {
            ring: RingWriter::new(region, config.layout(), config.poll_interval)?,
            name: name.to_string(),
            push_timeout: config.push_timeout,
            history: History::new(config.history_len),
        })
    }

    /// Push a state-mutating command. Never dropped; blocks up to the
    /// safety timeout and escalates to a fatal error beyond it.
    pub fn push_durable(&mut self, header: CommandHeader, payload: &[u8]) -> Result<()> {
        self.ring.push(header, payload, Some(self.push_timeout))?;
        self.history.record(&header);
        Ok(())
    }

    /// Push an informational command. Returns `false` (after a warning)
    /// if the ring was full and the command was dropped.
    pub fn push_lossy(&mut self, mut header: CommandHeader, payload: &[u8]) -> Result<bool> {
        header.flags = header.flags | CommandFlags::LOSSY;
        match self.ring.push(header, payload, None) {
            Ok(()) => {
                self.history.record(&header);
                Ok(true)
            }
            Err(ChannelError::Full) => {
                warn!(
                    channel = %self.name,
                    opcode = header.opcode.name(),
                    "channel full; dropping lossy command"
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// The last `n` commands pushed, oldest first. Diagnostic only.
    pub fn recent_history(&self, n: usize) -> Vec<HistoryEntry> {
        self.history.recent(n)
    }

    /// Channel name for logs and dumps.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload bytes produced but not yet consumed by the peer.
    pub fn data_in_flight(&self) -> u64 {
        self.ring.data_in_flight()
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("name", &self.name)
            .finish()
    }
}

/// Consumer endpoint of one channel direction.
pub struct ChannelReader {
    ring: RingReader,
    name: String,
    history: History,
}

impl ChannelReader {
    pub fn new(region: Arc<SharedRegion>, config: &ChannelConfig, name: &str) -> Result<Self> {
        Ok(Self {
            ring: RingReader::new(region, config.layout(), config.poll_interval)?,
            name: name.to_string(),
            history: History::new(config.history_len),
        })
    }

    /// Pop the next message, blocking up to `timeout`.
    pub fn try_pop(&mut self, timeout: Duration) -> Result<Message> {
        let msg = self.ring.try_pop(timeout)?;
        self.history.record(&msg.header);
        Ok(msg)
    }

    /// The last `n` commands received, oldest first. Diagnostic only.
    pub fn recent_history(&self, n: usize) -> Vec<HistoryEntry> {
        self.history.recent(n)
    }

    /// Channel name for logs and dumps.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of messages waiting to be popped.
    pub fn pending(&self) -> u64 {
        self.ring.pending()
    }
}

impl std::fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReader")
            .field("name", &self.name)
            .finish()
    }
}
