//! Session tuning parameters.

use std::time::Duration;

use serde::Deserialize;
use tone_bridge_types::ProtocolId;

use crate::playback::ShortReadPolicy;

/// Tuning parameters shared by the encoder, playback adapter and session loop.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Codec output volume (0..=100).
    pub volume_percent: u8,
    /// Codec protocol selector.
    pub protocol: ProtocolId,
    /// Codec frame size in samples; symbol lengths are multiples of this.
    pub samples_per_frame: usize,
    /// Wait after the device reports stopped before the session goes idle.
    pub settle_delay_ms: u64,
    /// Upper bound on waiting for a stop confirmation from the device.
    pub stop_timeout_ms: u64,
    /// Target device buffer duration.
    pub latency_ms: u32,
    /// Max input bytes per transmission.
    pub max_payload_bytes: usize,
    /// Encoder sleep between polls while waiting for more input.
    pub input_poll_ms: u64,
    /// What the playback adapter does when the pipe has no data yet.
    pub short_read: ShortReadPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            volume_percent: 30,
            protocol: ProtocolId::AudibleFastest,
            samples_per_frame: 1024,
            settle_delay_ms: 500,
            stop_timeout_ms: 2000,
            latency_ms: 100,
            max_payload_bytes: 140,
            input_poll_ms: 10,
            short_read: ShortReadPolicy::Silence,
        }
    }
}

impl SessionConfig {
    /// Clamp out-of-range values instead of rejecting them.
    pub fn normalized(mut self) -> Self {
        self.volume_percent = self.volume_percent.min(100);
        self.samples_per_frame = self.samples_per_frame.max(64);
        self.max_payload_bytes = self.max_payload_bytes.clamp(4, 1024);
        self.input_poll_ms = self.input_poll_ms.max(1);
        self
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn input_poll(&self) -> Duration {
        Duration::from_millis(self.input_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_device_setup() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.volume_percent, 30);
        assert_eq!(cfg.protocol, ProtocolId::AudibleFastest);
        assert_eq!(cfg.samples_per_frame, 1024);
        assert_eq!(cfg.settle_delay(), Duration::from_millis(500));
        assert_eq!(cfg.latency_ms, 100);
    }

    #[test]
    fn normalized_clamps_out_of_range_values() {
        let cfg = SessionConfig {
            volume_percent: 250,
            samples_per_frame: 8,
            max_payload_bytes: 0,
            input_poll_ms: 0,
            ..SessionConfig::default()
        }
        .normalized();
        assert_eq!(cfg.volume_percent, 100);
        assert_eq!(cfg.samples_per_frame, 64);
        assert_eq!(cfg.max_payload_bytes, 4);
        assert_eq!(cfg.input_poll_ms, 1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: SessionConfig = toml::from_str(
            r#"
            volume_percent = 55
            protocol = "ultrasound_fast"
            short_read = { poll = { attempts = 3, interval_us = 500 } }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.volume_percent, 55);
        assert_eq!(cfg.protocol, ProtocolId::UltrasoundFast);
        assert_eq!(
            cfg.short_read,
            ShortReadPolicy::Poll {
                attempts: 3,
                interval_us: 500
            }
        );
        assert_eq!(cfg.settle_delay_ms, 500);
    }
}
