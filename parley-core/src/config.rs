//! Core tunables. Hosts embed this as the `[core]` table of their config file.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// File chunk size in bytes (default 16 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest file that may be offered or accepted (default 64 MiB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Chunks emitted per transfer per `pump` call.
    #[serde(default = "default_chunks_per_pump")]
    pub chunks_per_pump: usize,
    /// Seconds an outgoing call rings before it is ended as unanswered.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Reconnect delay unit; attempt n waits n × this.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Attempts before falling back to relay.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Label of the chat sub-channel.
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
}

fn default_chunk_size() -> usize {
    16 * 1024
}
fn default_max_file_size() -> u64 {
    64 * 1024 * 1024
}
fn default_chunks_per_pump() -> usize {
    8
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_channel_label() -> String {
    "chat".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_file_size: default_max_file_size(),
            chunks_per_pump: default_chunks_per_pump(),
            call_timeout_secs: default_call_timeout_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            channel_label: default_channel_label(),
        }
    }
}

impl Config {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }
}
