use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use gfxbridge_shm::SharedRegion;
use gfxbridge_wire::{CommandHeader, HEADER_SIZE};

use crate::error::{ChannelError, Result};

// Control block layout at the start of every channel region. All four
// counters are monotonically increasing; ring indices are `counter % size`.
// 64 bytes keeps the producer- and consumer-owned cache lines apart.
const OFF_CMD_READ: usize = 0; // u64: command slots consumed
const OFF_CMD_WRITE: usize = 8; // u64: command slots produced
const OFF_DATA_READ: usize = 16; // u64: payload bytes consumed
const OFF_DATA_WRITE: usize = 24; // u64: payload bytes produced
pub(crate) const CTRL_SIZE: usize = 64;

/// Geometry of one channel: a command ring of fixed header slots plus a
/// byte ring for payloads, in a single shared memory region.
#[derive(Debug, Clone, Copy)]
pub struct RingLayout {
    /// Number of command slots.
    pub cmd_capacity: u64,
    /// Data ring size in bytes.
    pub data_len: usize,
}

impl RingLayout {
    /// Total region bytes this layout needs.
    pub fn region_len(&self) -> usize {
        CTRL_SIZE + self.cmd_capacity as usize * HEADER_SIZE + self.data_len
    }

    fn validate(&self, region: &SharedRegion) -> Result<()> {
        let need = self.region_len();
        if region.len() < need {
            return Err(ChannelError::RegionTooSmall {
                len: region.len(),
                need,
            });
        }
        Ok(())
    }

    fn slot_offset(&self, slot: u64) -> usize {
        CTRL_SIZE + (slot % self.cmd_capacity) as usize * HEADER_SIZE
    }

    fn data_base(&self) -> usize {
        CTRL_SIZE + self.cmd_capacity as usize * HEADER_SIZE
    }
}

/// A message popped from a channel: decoded header plus its payload bytes,
/// already copied out of the ring.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: CommandHeader,
    pub payload: Bytes,
}

/// Producer half of one channel.
///
/// Single-producer discipline: exactly one `RingWriter` exists per channel
/// direction, and callers that share it (multiple application threads
/// pushing into the same device channel) serialize through an outer lock.
pub struct RingWriter {
    region: Arc<SharedRegion>,
    layout: RingLayout,
    poll: Duration,
}

impl RingWriter {
    pub fn new(region: Arc<SharedRegion>, layout: RingLayout, poll: Duration) -> Result<Self> {
        layout.validate(&region)?;
        Ok(Self {
            region,
            layout,
            poll,
        })
    }

    /// Push a command and its payload.
    ///
    /// Blocks while the ring is full, up to `timeout`; a `None` timeout
    /// fails immediately with [`ChannelError::Full`] (the lossy policy).
    /// The header's `payload_size`/`payload_offset` fields are filled in
    /// here — they describe ring positions only this writer knows.
    pub fn push(
        &mut self,
        mut header: CommandHeader,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<()> {
        if payload.len() > self.layout.data_len {
            return Err(ChannelError::PayloadTooLarge {
                size: payload.len(),
                max: self.layout.data_len,
            });
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let cmd_write = self.region.atomic_u64(OFF_CMD_WRITE).load(Ordering::Relaxed);
        let data_write = self
            .region
            .atomic_u64(OFF_DATA_WRITE)
            .load(Ordering::Relaxed);

        // Wait for a free command slot and enough payload space.
        loop {
            let cmd_read = self.region.atomic_u64(OFF_CMD_READ).load(Ordering::Acquire);
            let data_read = self.region.atomic_u64(OFF_DATA_READ).load(Ordering::Acquire);
            let slot_free = cmd_write - cmd_read < self.layout.cmd_capacity;
            let data_free =
                data_write + payload.len() as u64 - data_read <= self.layout.data_len as u64;
            if slot_free && data_free {
                break;
            }
            match deadline {
                None => return Err(ChannelError::Full),
                Some(d) if Instant::now() >= d => {
                    return Err(ChannelError::Stalled(timeout.unwrap_or_default()));
                }
                Some(_) => std::thread::sleep(self.poll),
            }
        }

        self.copy_in(data_write, payload);
        let new_data_write = data_write + payload.len() as u64;

        header.payload_size = payload.len() as u32;
        header.payload_offset = new_data_write as u32;
        self.region
            .write_bytes(self.layout.slot_offset(cmd_write), &header.encode());

        self.region
            .atomic_u64(OFF_DATA_WRITE)
            .store(new_data_write, Ordering::Relaxed);
        // Publishes the slot and payload writes above to the consumer.
        self.region
            .atomic_u64(OFF_CMD_WRITE)
            .store(cmd_write + 1, Ordering::Release);
        Ok(())
    }

    /// Payload bytes currently in flight (produced, not yet consumed).
    pub fn data_in_flight(&self) -> u64 {
        let write = self
            .region
            .atomic_u64(OFF_DATA_WRITE)
            .load(Ordering::Relaxed);
        let read = self.region.atomic_u64(OFF_DATA_READ).load(Ordering::Acquire);
        write - read
    }

    fn copy_in(&self, pos: u64, payload: &[u8]) {
        let base = self.layout.data_base();
        let len = self.layout.data_len;
        let start = (pos % len as u64) as usize;
        let first = payload.len().min(len - start);
        self.region.write_bytes(base + start, &payload[..first]);
        if first < payload.len() {
            // Wrapped: remainder goes to the front of the ring.
            self.region.write_bytes(base, &payload[first..]);
        }
    }
}

impl std::fmt::Debug for RingWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingWriter")
            .field("layout", &self.layout)
            .finish()
    }
}

/// Consumer half of one channel. Single-consumer discipline, like the
/// writer.
pub struct RingReader {
    region: Arc<SharedRegion>,
    layout: RingLayout,
    poll: Duration,
}

impl RingReader {
    pub fn new(region: Arc<SharedRegion>, layout: RingLayout, poll: Duration) -> Result<Self> {
        layout.validate(&region)?;
        Ok(Self {
            region,
            layout,
            poll,
        })
    }

    /// Pop the next message, blocking up to `timeout`.
    ///
    /// After copying the payload out, the reader's data position must match
    /// the `payload_offset` the producer recorded; a mismatch means the two
    /// sides disagree about message framing and is fatal.
    pub fn try_pop(&mut self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        let cmd_read = self.region.atomic_u64(OFF_CMD_READ).load(Ordering::Relaxed);

        loop {
            let cmd_write = self.region.atomic_u64(OFF_CMD_WRITE).load(Ordering::Acquire);
            if cmd_read < cmd_write {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::Timeout(timeout));
            }
            std::thread::sleep(self.poll);
        }

        let mut slot = [0u8; HEADER_SIZE];
        self.region
            .read_bytes(self.layout.slot_offset(cmd_read), &mut slot);
        let header = CommandHeader::decode(&slot)?;

        let data_read = self.region.atomic_u64(OFF_DATA_READ).load(Ordering::Relaxed);
        let payload = self.copy_out(data_read, header.payload_size as usize);
        let new_data_read = data_read + u64::from(header.payload_size);

        if new_data_read as u32 != header.payload_offset {
            return Err(ChannelError::DataDesync {
                expected: header.payload_offset,
                actual: new_data_read as u32,
            });
        }

        // Frees payload space for the producer.
        self.region
            .atomic_u64(OFF_DATA_READ)
            .store(new_data_read, Ordering::Release);
        self.region
            .atomic_u64(OFF_CMD_READ)
            .store(cmd_read + 1, Ordering::Release);

        Ok(Message { header, payload })
    }

    /// Number of messages waiting.
    pub fn pending(&self) -> u64 {
        let write = self.region.atomic_u64(OFF_CMD_WRITE).load(Ordering::Acquire);
        let read = self.region.atomic_u64(OFF_CMD_READ).load(Ordering::Relaxed);
        write - read
    }

    fn copy_out(&self, pos: u64, len: usize) -> Bytes {
        let base = self.layout.data_base();
        let ring_len = self.layout.data_len;
        let start = (pos % ring_len as u64) as usize;
        let mut out = BytesMut::zeroed(len);
        let first = len.min(ring_len - start);
        self.region.read_bytes(base + start, &mut out[..first]);
        if first < len {
            self.region.read_bytes(base, &mut out[first..]);
        }
        out.freeze()
    }
}

impl std::fmt::Debug for RingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingReader")
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use gfxbridge_wire::{CommandFlags, Opcode};

    use super::*;

    const POLL: Duration = Duration::from_micros(50);

    fn pair(cmd_capacity: u64, data_len: usize) -> (RingWriter, RingReader) {
        let layout = RingLayout {
            cmd_capacity,
            data_len,
        };
        let region = Arc::new(SharedRegion::anonymous(layout.region_len()).unwrap());
        region.zero();
        let writer = RingWriter::new(Arc::clone(&region), layout, POLL).unwrap();
        let reader = RingReader::new(region, layout, POLL).unwrap();
        (writer, reader)
    }

    fn header(opcode: Opcode, correlation: u32) -> CommandHeader {
        CommandHeader {
            opcode,
            flags: CommandFlags::NONE,
            target: 1,
            correlation,
            payload_size: 0,
            payload_offset: 0,
        }
    }

    #[test]
    fn push_pop_round_trip() {
        let (mut writer, mut reader) = pair(8, 1024);
        writer
            .push(header(Opcode::DeviceClear, 3), b"payload", None)
            .unwrap();

        let msg = reader.try_pop(Duration::from_millis(100)).unwrap();
        assert_eq!(msg.header.opcode, Opcode::DeviceClear);
        assert_eq!(msg.header.correlation, 3);
        assert_eq!(msg.payload.as_ref(), b"payload");
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (mut writer, mut reader) = pair(64, 8192);
        for i in 0..50u32 {
            let payload = format!("msg-{i}");
            writer
                .push(header(Opcode::DeviceSetRenderState, i), payload.as_bytes(), None)
                .unwrap();
        }
        for i in 0..50u32 {
            let msg = reader.try_pop(Duration::from_millis(100)).unwrap();
            assert_eq!(msg.header.correlation, i);
            assert_eq!(msg.payload.as_ref(), format!("msg-{i}").as_bytes());
        }
    }

    #[test]
    fn pop_times_out_on_empty_ring() {
        let (_writer, mut reader) = pair(8, 256);
        let err = reader.try_pop(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[test]
    fn lossy_push_reports_full() {
        let (mut writer, _reader) = pair(2, 256);
        writer.push(header(Opcode::DebugMessage, 0), b"a", None).unwrap();
        writer.push(header(Opcode::DebugMessage, 1), b"b", None).unwrap();
        let err = writer
            .push(header(Opcode::DebugMessage, 2), b"c", None)
            .unwrap_err();
        assert!(matches!(err, ChannelError::Full));
    }

    #[test]
    fn durable_push_blocks_until_space_frees() {
        let (mut writer, mut reader) = pair(2, 256);
        writer.push(header(Opcode::DeviceClear, 0), b"a", None).unwrap();
        writer.push(header(Opcode::DeviceClear, 1), b"b", None).unwrap();

        let drainer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let msg = reader.try_pop(Duration::from_millis(200)).unwrap();
            assert_eq!(msg.header.correlation, 0);
            reader
        });

        writer
            .push(
                header(Opcode::DeviceClear, 2),
                b"c",
                Some(Duration::from_secs(2)),
            )
            .unwrap();
        let mut reader = drainer.join().unwrap();
        assert_eq!(
            reader.try_pop(Duration::from_millis(100)).unwrap().header.correlation,
            1
        );
        assert_eq!(
            reader.try_pop(Duration::from_millis(100)).unwrap().header.correlation,
            2
        );
    }

    #[test]
    fn durable_push_stalls_when_consumer_is_gone() {
        let (mut writer, _reader) = pair(1, 256);
        writer.push(header(Opcode::DeviceClear, 0), b"a", None).unwrap();
        let err = writer
            .push(
                header(Opcode::DeviceClear, 1),
                b"b",
                Some(Duration::from_millis(30)),
            )
            .unwrap_err();
        assert!(matches!(err, ChannelError::Stalled(_)));
    }

    #[test]
    fn oversized_payload_is_rejected_up_front() {
        let (mut writer, _reader) = pair(8, 64);
        let err = writer
            .push(header(Opcode::DeviceClear, 0), &[0u8; 128], None)
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::PayloadTooLarge { size: 128, max: 64 }
        ));
    }

    #[test]
    fn payload_wraps_around_data_ring_edge() {
        let (mut writer, mut reader) = pair(16, 64);
        // Walk the data position close to the edge, then push a payload
        // that must split across the wrap point.
        for i in 0..3u32 {
            writer
                .push(header(Opcode::DeviceClear, i), &[i as u8; 20], None)
                .unwrap();
            let msg = reader.try_pop(Duration::from_millis(100)).unwrap();
            assert_eq!(msg.payload.as_ref(), &[i as u8; 20][..]);
        }
        let pattern: Vec<u8> = (0..32u8).collect();
        writer
            .push(header(Opcode::DeviceClear, 9), &pattern, None)
            .unwrap();
        let msg = reader.try_pop(Duration::from_millis(100)).unwrap();
        assert_eq!(msg.payload.as_ref(), pattern.as_slice());
    }

    #[test]
    fn fifo_under_concurrent_producer_and_consumer() {
        let (mut writer, mut reader) = pair(32, 4096);
        const COUNT: u32 = 2000;

        let producer = std::thread::spawn(move || {
            for i in 0..COUNT {
                writer
                    .push(
                        header(Opcode::DeviceDrawPrimitive, i),
                        &i.to_le_bytes(),
                        Some(Duration::from_secs(10)),
                    )
                    .unwrap();
            }
        });

        for i in 0..COUNT {
            let msg = reader.try_pop(Duration::from_secs(10)).unwrap();
            assert_eq!(msg.header.correlation, i, "messages reordered or lost");
            assert_eq!(msg.payload.as_ref(), i.to_le_bytes());
        }
        producer.join().unwrap();
    }

    #[test]
    fn undersized_region_is_rejected() {
        let layout = RingLayout {
            cmd_capacity: 1024,
            data_len: 1 << 20,
        };
        let region = Arc::new(SharedRegion::anonymous(4096).unwrap());
        assert!(matches!(
            RingWriter::new(region, layout, POLL),
            Err(ChannelError::RegionTooSmall { .. })
        ));
    }
}
