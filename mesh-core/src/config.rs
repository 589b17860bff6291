//! Tunables for the session core. Timing is in ticks (the host ticks once per second)
//! except for delays the host schedules itself.

use std::time::Duration;

use serde::Deserialize;

use crate::chunk::DEFAULT_CHUNK_SIZE;

/// Core configuration. Deserializable so hosts can embed it in their config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Bytes per CHUNK frame (default 16 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Chunk emission suspends while more than this many bytes are buffered.
    #[serde(default = "default_buffer_low_threshold")]
    pub buffer_low_threshold: u64,
    #[serde(default = "default_ack_timeout_ticks")]
    pub ack_timeout_ticks: u64,
    /// Signaling keep-alive interval.
    #[serde(default = "default_keepalive_ticks")]
    pub keepalive_ticks: u64,
    /// Direct-channel heartbeat interval.
    #[serde(default = "default_channel_heartbeat_ticks")]
    pub channel_heartbeat_ticks: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_ice_restart_cooldown_ticks")]
    pub ice_restart_cooldown_ticks: u64,
    #[serde(default = "default_max_ice_restarts")]
    pub max_ice_restarts: u32,
    /// Pause between one job finishing and the next starting.
    #[serde(default = "default_dispatch_delay_ms")]
    pub dispatch_delay_ms: u64,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_buffer_low_threshold() -> u64 {
    16 * 1024 * 1024
}
fn default_ack_timeout_ticks() -> u64 {
    30
}
fn default_keepalive_ticks() -> u64 {
    25
}
fn default_channel_heartbeat_ticks() -> u64 {
    20
}
fn default_reconnect_base_ms() -> u64 {
    1_000
}
fn default_reconnect_cap_ms() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_ice_restart_cooldown_ticks() -> u64 {
    5
}
fn default_max_ice_restarts() -> u32 {
    3
}
fn default_dispatch_delay_ms() -> u64 {
    100
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            buffer_low_threshold: default_buffer_low_threshold(),
            ack_timeout_ticks: default_ack_timeout_ticks(),
            keepalive_ticks: default_keepalive_ticks(),
            channel_heartbeat_ticks: default_channel_heartbeat_ticks(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ice_restart_cooldown_ticks: default_ice_restart_cooldown_ticks(),
            max_ice_restarts: default_max_ice_restarts(),
            dispatch_delay_ms: default_dispatch_delay_ms(),
        }
    }
}

impl CoreConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_gives_defaults() {
        let c: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c, CoreConfig::default());
        assert_eq!(c.chunk_size, 16 * 1024 * 1024);
        assert_eq!(c.reconnect_cap(), Duration::from_secs(30));
    }

    #[test]
    fn partial_override() {
        let c: CoreConfig = serde_json::from_str(r#"{"chunk_size":65536,"max_ice_restarts":1}"#).unwrap();
        assert_eq!(c.chunk_size, 65536);
        assert_eq!(c.max_ice_restarts, 1);
        assert_eq!(c.ack_timeout_ticks, 30);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(serde_json::from_str::<CoreConfig>(r#"{"chunk":1}"#).is_err());
    }
}
