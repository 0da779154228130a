use std::time::{Duration, Instant};

use gfxbridge_channel::{ChannelError, ChannelReader, ChannelWriter};
use gfxbridge_wire::{CommandHeader, Opcode, PayloadWriter};
use tracing::{info, warn};

use crate::error::{ClientError, Result};

const POP_SLICE: Duration = Duration::from_millis(50);

/// Interceptor side of the startup handshake, run on the module channel
/// before any other traffic:
///
/// 1. interceptor → worker: `Syn` carrying the interceptor's process id
/// 2. worker → interceptor: `Ack`
/// 3. interceptor → worker: `Continue`
///
/// Any step missing its slice of the startup timeout fails the whole
/// bridge — a worker that cannot complete this will not process commands
/// either.
pub fn handshake_client(
    writer: &mut ChannelWriter,
    reader: &mut ChannelReader,
    startup_timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + startup_timeout;

    let mut payload = PayloadWriter::new();
    payload.put_u32(std::process::id());
    writer.push_durable(CommandHeader::control(Opcode::Syn), &payload.finish())?;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ClientError::Handshake(format!(
                "no Ack from worker within {startup_timeout:?}"
            )));
        }
        match reader.try_pop(POP_SLICE.min(deadline - now)) {
            Ok(msg) if msg.header.opcode == Opcode::Ack => {
                info!("handshake Ack received; telling worker to continue");
                writer.push_durable(CommandHeader::control(Opcode::Continue), &[])?;
                return Ok(());
            }
            Ok(msg) => {
                warn!(opcode = msg.header.opcode.name(), "unexpected message during handshake");
            }
            Err(ChannelError::Timeout(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }
}
