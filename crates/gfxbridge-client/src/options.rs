use std::path::Path;
use std::time::Duration;

use gfxbridge_channel::ChannelConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ClientError, Result};

/// Environment variable naming an options file to load at init.
pub const OPTIONS_FILE_ENV: &str = "GFXBRIDGE_CONFIG";

/// Session-wide configuration, consumed once at initialization.
///
/// Resolution order: built-in defaults, then the JSON options file (if
/// `GFXBRIDGE_CONFIG` names one), then individual `GFXBRIDGE_*`
/// environment variables. Invalid environment values are warned about and
/// ignored rather than failing startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// Command slots in the high-frequency device channel.
    pub device_cmd_capacity: u64,
    /// Data ring bytes in the device channel.
    pub device_data_len: usize,
    /// Command slots in the module/bootstrap channel.
    pub module_cmd_capacity: u64,
    /// Data ring bytes in the module channel.
    pub module_data_len: usize,
    /// How long a synchronous call waits for the worker's response.
    pub ack_timeout_ms: u64,
    /// How long the handshake may take before startup fails.
    pub startup_timeout_ms: u64,
    /// Safety bound on a durable push into a full channel. Beyond this
    /// the consumer is considered gone and the session fails.
    pub push_timeout_ms: u64,
    /// Whether bulk payloads go through the shared heap arena.
    pub shared_heap_enabled: bool,
    /// Arena size in bytes.
    pub shared_heap_len: usize,
    /// Wait for worker answers to object-creation calls instead of
    /// assuming success.
    pub send_create_responses: bool,
    /// Wait for worker answers to every forwarded call that can carry
    /// one. Slow; a debugging aid.
    pub send_all_responses: bool,
    /// Pace frame submission against the worker.
    pub frame_pacing_enabled: bool,
    /// How many frames the interceptor may run ahead of the worker.
    pub max_frames_ahead: u32,
    /// Per-channel bounded command history for postmortem dumps.
    pub history_len: usize,
    /// Worker executable to spawn.
    pub worker_program: String,
    /// Base name for shared memory regions and semaphores.
    pub channel_base_name: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            device_cmd_capacity: 4096,
            device_data_len: 16 * 1024 * 1024,
            module_cmd_capacity: 256,
            module_data_len: 1024 * 1024,
            ack_timeout_ms: 5000,
            startup_timeout_ms: 30_000,
            push_timeout_ms: 10_000,
            shared_heap_enabled: true,
            shared_heap_len: 64 * 1024 * 1024,
            send_create_responses: false,
            send_all_responses: false,
            frame_pacing_enabled: true,
            max_frames_ahead: 3,
            history_len: 128,
            worker_program: "gfxbridge-server".to_string(),
            channel_base_name: "gfxbridge".to_string(),
        }
    }
}

impl BridgeOptions {
    /// Defaults, overlaid with the options file and environment.
    pub fn load() -> Self {
        let mut options = match std::env::var(OPTIONS_FILE_ENV) {
            Ok(path) => Self::from_file(Path::new(&path)).unwrap_or_else(|err| {
                warn!(%err, "ignoring unusable options file");
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        options.apply_env();
        options
    }

    /// Parse an options file (JSON, all fields optional).
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| ClientError::Options {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|err| ClientError::Options {
            path: path.display().to_string(),
            reason: err.to_string(),
        })
    }

    /// Overlay `GFXBRIDGE_*` environment variables.
    pub fn apply_env(&mut self) {
        env_override("GFXBRIDGE_ACK_TIMEOUT_MS", &mut self.ack_timeout_ms);
        env_override("GFXBRIDGE_STARTUP_TIMEOUT_MS", &mut self.startup_timeout_ms);
        env_override("GFXBRIDGE_PUSH_TIMEOUT_MS", &mut self.push_timeout_ms);
        env_override("GFXBRIDGE_DEVICE_CMD_CAPACITY", &mut self.device_cmd_capacity);
        env_override("GFXBRIDGE_DEVICE_DATA_LEN", &mut self.device_data_len);
        env_override("GFXBRIDGE_MODULE_CMD_CAPACITY", &mut self.module_cmd_capacity);
        env_override("GFXBRIDGE_MODULE_DATA_LEN", &mut self.module_data_len);
        env_override("GFXBRIDGE_SHARED_HEAP_ENABLED", &mut self.shared_heap_enabled);
        env_override("GFXBRIDGE_SHARED_HEAP_LEN", &mut self.shared_heap_len);
        env_override(
            "GFXBRIDGE_SEND_CREATE_RESPONSES",
            &mut self.send_create_responses,
        );
        env_override("GFXBRIDGE_SEND_ALL_RESPONSES", &mut self.send_all_responses);
        env_override(
            "GFXBRIDGE_FRAME_PACING_ENABLED",
            &mut self.frame_pacing_enabled,
        );
        env_override("GFXBRIDGE_MAX_FRAMES_AHEAD", &mut self.max_frames_ahead);
        env_override("GFXBRIDGE_HISTORY_LEN", &mut self.history_len);
        if let Ok(value) = std::env::var("GFXBRIDGE_WORKER_PROGRAM") {
            self.worker_program = value;
        }
        if let Ok(value) = std::env::var("GFXBRIDGE_CHANNEL_BASE_NAME") {
            self.channel_base_name = value;
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn device_channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            cmd_capacity: self.device_cmd_capacity,
            data_len: self.device_data_len,
            push_timeout: Duration::from_millis(self.push_timeout_ms),
            history_len: self.history_len,
            ..ChannelConfig::default()
        }
    }

    pub fn module_channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            cmd_capacity: self.module_cmd_capacity,
            data_len: self.module_data_len,
            push_timeout: Duration::from_millis(self.push_timeout_ms),
            history_len: self.history_len,
            ..ChannelConfig::default()
        }
    }
}

fn env_override<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(name, value = %raw, "ignoring unparsable option override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let options = BridgeOptions::default();
        assert_eq!(options.ack_timeout_ms, 5000);
        assert_eq!(options.startup_timeout_ms, 30_000);
        assert_eq!(options.max_frames_ahead, 3);
        assert!(options.shared_heap_enabled);
        assert!(options.frame_pacing_enabled);
        assert!(!options.send_all_responses);
    }

    #[test]
    fn options_file_overlays_defaults() {
        let dir = std::env::temp_dir().join(format!("gfxbridge-options-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("options.json");
        std::fs::write(&path, r#"{ "ack_timeout_ms": 250, "max_frames_ahead": 1 }"#).unwrap();

        let options = BridgeOptions::from_file(&path).unwrap();
        assert_eq!(options.ack_timeout_ms, 250);
        assert_eq!(options.max_frames_ahead, 1);
        // Untouched fields keep defaults.
        assert_eq!(options.startup_timeout_ms, 30_000);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_options_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("gfxbridge-badopts-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("options.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            BridgeOptions::from_file(&path),
            Err(ClientError::Options { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn channel_configs_reflect_options() {
        let options = BridgeOptions {
            device_cmd_capacity: 8,
            device_data_len: 4096,
            push_timeout_ms: 77,
            ..BridgeOptions::default()
        };
        let config = options.device_channel_config();
        assert_eq!(config.cmd_capacity, 8);
        assert_eq!(config.data_len, 4096);
        assert_eq!(config.push_timeout, Duration::from_millis(77));
    }
}
