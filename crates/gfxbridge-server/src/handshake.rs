use std::time::{Duration, Instant};

use gfxbridge_channel::{ChannelError, ChannelReader, ChannelWriter};
use gfxbridge_wire::{CommandHeader, Opcode, PayloadReader};
use tracing::{info, warn};

use crate::error::{Result, ServerError};

const POP_SLICE: Duration = Duration::from_millis(50);

/// Worker side of the startup handshake: wait for `Syn`, answer with
/// `Ack`, then wait for `Continue` before entering the command loop.
pub fn handshake_server(
    rx: &mut ChannelReader,
    tx: &mut ChannelWriter,
    startup_timeout: Duration,
) -> Result<()> {
    let client_pid = wait_for(rx, Opcode::Syn, startup_timeout)?;
    if let Some(pid) = client_pid {
        info!(client_pid = pid, "Syn received");
    }

    tx.push_durable(CommandHeader::control(Opcode::Ack), &[])?;

    wait_for(rx, Opcode::Continue, startup_timeout)?;
    info!("handshake complete; entering command loop");
    Ok(())
}

fn wait_for(
    rx: &mut ChannelReader,
    expected: Opcode,
    timeout: Duration,
) -> Result<Option<u32>> {
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ServerError::Handshake(format!(
                "no {} from interceptor within {timeout:?}",
                expected.name()
            )));
        }
        match rx.try_pop(POP_SLICE.min(deadline - now)) {
            Ok(msg) if msg.header.opcode == expected => {
                if msg.payload.is_empty() {
                    return Ok(None);
                }
                let mut reader = PayloadReader::new(msg.payload);
                let value = reader.get_u32().ok();
                return Ok(value);
            }
            Ok(msg) => {
                warn!(opcode = msg.header.opcode.name(), "unexpected message during handshake");
            }
            Err(ChannelError::Timeout(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gfxbridge_channel::ChannelConfig;
    use gfxbridge_shm::SharedRegion;
    use gfxbridge_wire::PayloadWriter;

    use super::*;

    fn channel_pair(config: &ChannelConfig) -> (ChannelWriter, ChannelReader) {
        let region = Arc::new(SharedRegion::anonymous(config.region_len()).unwrap());
        (
            ChannelWriter::new(Arc::clone(&region), config, "mod").unwrap(),
            ChannelReader::new(region, config, "mod").unwrap(),
        )
    }

    #[test]
    fn handshake_acks_syn_and_waits_for_continue() {
        let config = ChannelConfig::module_default();
        let (mut c2w_writer, mut c2w_reader) = channel_pair(&config);
        let (mut w2c_writer, mut w2c_reader) = channel_pair(&config);

        let client = std::thread::spawn(move || {
            let mut payload = PayloadWriter::new();
            payload.put_u32(1234);
            c2w_writer
                .push_durable(CommandHeader::control(Opcode::Syn), &payload.finish())
                .unwrap();
            let ack = w2c_reader.try_pop(Duration::from_secs(5)).unwrap();
            assert_eq!(ack.header.opcode, Opcode::Ack);
            c2w_writer
                .push_durable(CommandHeader::control(Opcode::Continue), &[])
                .unwrap();
        });

        handshake_server(&mut c2w_reader, &mut w2c_writer, Duration::from_secs(5)).unwrap();
        client.join().unwrap();
    }

    #[test]
    fn handshake_times_out_without_syn() {
        let config = ChannelConfig::module_default();
        let (_c2w_writer, mut c2w_reader) = channel_pair(&config);
        let (mut w2c_writer, _w2c_reader) = channel_pair(&config);

        let err = handshake_server(
            &mut c2w_reader,
            &mut w2c_writer,
            Duration::from_millis(80),
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::Handshake(_)));
    }
}
