mod exit;
mod logging;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use gfxbridge_channel::{ChannelReader, ChannelWriter};
use gfxbridge_client::BridgeOptions;
use gfxbridge_heap::HeapView;
use gfxbridge_server::{handshake_server, NullEngine, Worker, WorkerChannels};
use gfxbridge_shm::{NamedSemaphore, SharedRegion};
use tracing::{info, warn};

use crate::logging::{init_logging, LogFormat, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "gfxbridge-server", version, about = "gfxbridge worker process")]
struct Cli {
    /// Base name of the shared memory regions created by the interceptor.
    #[arg(long, value_name = "NAME", env = "GFXBRIDGE_CHANNEL_BASE")]
    channel_base: String,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    match run(&cli.channel_base) {
        Ok(()) => std::process::exit(exit::SUCCESS),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(exit::code_for(&err));
        }
    }
}

fn run(base: &str) -> gfxbridge_server::Result<()> {
    // Options come from the environment inherited from the interceptor,
    // so both processes compute identical channel geometry.
    let options = BridgeOptions::load();
    let device_config = options.device_channel_config();
    let module_config = options.module_channel_config();

    let dev_c2w = Arc::new(SharedRegion::open(
        &format!("{base}-dev-c2w"),
        device_config.region_len(),
    )?);
    let dev_w2c = Arc::new(SharedRegion::open(
        &format!("{base}-dev-w2c"),
        device_config.region_len(),
    )?);
    let mod_c2w = Arc::new(SharedRegion::open(
        &format!("{base}-mod-c2w"),
        module_config.region_len(),
    )?);
    let mod_w2c = Arc::new(SharedRegion::open(
        &format!("{base}-mod-w2c"),
        module_config.region_len(),
    )?);

    let mut channels = WorkerChannels {
        device_rx: ChannelReader::new(dev_c2w, &device_config, "device.to_worker")?,
        device_tx: ChannelWriter::new(dev_w2c, &device_config, "device.to_client")?,
        module_rx: ChannelReader::new(mod_c2w, &module_config, "module.to_worker")?,
        module_tx: ChannelWriter::new(mod_w2c, &module_config, "module.to_client")?,
    };

    let heap = if options.shared_heap_enabled {
        let region = Arc::new(SharedRegion::open(
            &format!("{base}-heap"),
            options.shared_heap_len,
        )?);
        Some(HeapView::new(region))
    } else {
        None
    };

    let pacer = if options.frame_pacing_enabled {
        Some(NamedSemaphore::open(&format!("{base}-present"))?)
    } else {
        None
    };

    handshake_server(
        &mut channels.module_rx,
        &mut channels.module_tx,
        options.startup_timeout(),
    )?;

    let mut worker = Worker::new(NullEngine::default(), heap, pacer);
    let stop = worker.stop_handle();
    if let Err(err) = ctrlc::set_handler(move || stop.store(true, Ordering::Release)) {
        warn!(%err, "failed to install signal handler");
    }

    let result = worker.run(&mut channels);
    info!(
        objects = worker.registry().len(),
        presents = worker.engine().presents,
        "worker loop finished"
    );
    result
}
