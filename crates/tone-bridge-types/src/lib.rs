use serde::{Deserialize, Serialize};

/// Transmission protocol selector passed to the codec.
///
/// Audible protocols stay well below the Nyquist limit of common device rates;
/// ultrasound protocols need a device rate high enough to carry their top tone.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolId {
    AudibleNormal,
    AudibleFast,
    #[default]
    AudibleFastest,
    UltrasoundNormal,
    UltrasoundFast,
    UltrasoundFastest,
}

impl ProtocolId {
    /// All protocols in declaration order.
    pub const ALL: [ProtocolId; 6] = [
        ProtocolId::AudibleNormal,
        ProtocolId::AudibleFast,
        ProtocolId::AudibleFastest,
        ProtocolId::UltrasoundNormal,
        ProtocolId::UltrasoundFast,
        ProtocolId::UltrasoundFastest,
    ];

    /// Stable snake_case name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolId::AudibleNormal => "audible_normal",
            ProtocolId::AudibleFast => "audible_fast",
            ProtocolId::AudibleFastest => "audible_fastest",
            ProtocolId::UltrasoundNormal => "ultrasound_normal",
            ProtocolId::UltrasoundFast => "ultrasound_fast",
            ProtocolId::UltrasoundFastest => "ultrasound_fastest",
        }
    }

    pub fn is_ultrasound(self) -> bool {
        matches!(
            self,
            ProtocolId::UltrasoundNormal
                | ProtocolId::UltrasoundFast
                | ProtocolId::UltrasoundFastest
        )
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProtocolId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace('-', "_");
        ProtocolId::ALL
            .into_iter()
            .find(|p| p.as_str() == needle)
            .ok_or_else(|| format!("unknown protocol: {s}"))
    }
}

/// Reason why an encode-and-play cycle ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Encoder closed the stream and the device drained it.
    Eof,
    /// Device or codec fault ended the cycle.
    Error,
    /// Cycle was explicitly stopped.
    Stopped,
}

/// Lifecycle state of an encode session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    /// Encoder running and device playing.
    Playing,
    /// Stop requested or device stopped; waiting for the settle delay.
    Stopping,
}

/// Point-in-time status of an encode session.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    /// Current lifecycle state.
    pub state: SessionState,
    /// Generation of the current (or last) cycle; 0 before the first cycle.
    pub generation: u64,
    /// Output device name.
    pub device: Option<String>,
    /// Negotiated sample rate (Hz).
    pub sample_rate: Option<u32>,
    /// Negotiated sample format label (for example `i16`).
    pub sample_format: Option<String>,
    /// PCM bytes appended by the encoder in this cycle.
    pub bytes_encoded: u64,
    /// PCM bytes consumed by the device in this cycle.
    pub bytes_played: u64,
    /// Count of device callbacks that ran short of data.
    pub underrun_events: u64,
    /// Frames emitted as silence because no data was ready.
    pub underrun_frames: u64,
    /// End reason of the last finished cycle.
    pub end_reason: Option<PlaybackEndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parses_loose_names() {
        assert_eq!("audible-fast".parse::<ProtocolId>(), Ok(ProtocolId::AudibleFast));
        assert_eq!(
            " Ultrasound_Normal ".parse::<ProtocolId>(),
            Ok(ProtocolId::UltrasoundNormal)
        );
        assert!("dialup".parse::<ProtocolId>().is_err());
    }

    #[test]
    fn protocol_serde_matches_as_str() {
        for p in ProtocolId::ALL {
            let json = serde_json::to_string(&p).unwrap();
            assert_eq!(json, format!("\"{}\"", p.as_str()));
        }
    }

    #[test]
    fn status_defaults_to_idle() {
        let status = SessionStatus::default();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.generation, 0);
        assert!(status.end_reason.is_none());
    }

    #[test]
    fn end_reason_serializes_snake_case() {
        let json = serde_json::to_string(&PlaybackEndReason::Eof).unwrap();
        assert_eq!(json, "\"eof\"");
    }
}
