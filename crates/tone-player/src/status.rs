//! Playback counters and the shared session status store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tone_bridge_types::{PlaybackEndReason, SessionState, SessionStatus};

/// Counters shared by the encoder thread, the device callback and the session loop.
#[derive(Clone, Debug, Default)]
pub struct PlaybackCounters {
    bytes_encoded: Arc<AtomicU64>,
    bytes_played: Arc<AtomicU64>,
    underrun_events: Arc<AtomicU64>,
    underrun_frames: Arc<AtomicU64>,
}

/// Plain copy of [`PlaybackCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub bytes_encoded: u64,
    pub bytes_played: u64,
    pub underrun_events: u64,
    pub underrun_frames: u64,
}

impl PlaybackCounters {
    pub fn add_bytes_encoded(&self, n: u64) {
        self.bytes_encoded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_played(&self, n: u64) {
        self.bytes_played.fetch_add(n, Ordering::Relaxed);
    }

    /// One short callback that had to emit `frames` of silence.
    pub fn record_underrun(&self, frames: u64) {
        self.underrun_events.fetch_add(1, Ordering::Relaxed);
        self.underrun_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_encoded: self.bytes_encoded.load(Ordering::Relaxed),
            bytes_played: self.bytes_played.load(Ordering::Relaxed),
            underrun_events: self.underrun_events.load(Ordering::Relaxed),
            underrun_frames: self.underrun_frames.load(Ordering::Relaxed),
        }
    }
}

/// Shared session status updated by the control loop.
#[derive(Debug, Default)]
pub struct SessionStatusState {
    pub state: SessionState,
    pub generation: u64,
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub sample_format: Option<String>,
    /// Counters of the current (or last) cycle.
    pub counters: Option<PlaybackCounters>,
    pub end_reason: Option<PlaybackEndReason>,
}

impl SessionStatusState {
    /// Create a shared, mutex-protected status store.
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Return a snapshot suitable for logging or serialization.
    pub fn snapshot(&self) -> SessionStatus {
        let counters = self
            .counters
            .as_ref()
            .map(PlaybackCounters::snapshot)
            .unwrap_or_default();
        SessionStatus {
            state: self.state,
            generation: self.generation,
            device: self.device.clone(),
            sample_rate: self.sample_rate,
            sample_format: self.sample_format.clone(),
            bytes_encoded: counters.bytes_encoded,
            bytes_played: counters.bytes_played,
            underrun_events: counters.underrun_events,
            underrun_frames: counters.underrun_frames,
            end_reason: self.end_reason,
        }
    }

    /// Reset per-cycle fields for a new cycle.
    pub fn begin_cycle(&mut self, generation: u64, counters: PlaybackCounters) {
        self.state = SessionState::Playing;
        self.generation = generation;
        self.counters = Some(counters);
        self.end_reason = None;
    }
}

/// Lock helper that tolerates poisoning; status is advisory.
pub(crate) fn with_status<R>(
    status: &Mutex<SessionStatusState>,
    f: impl FnOnce(&mut SessionStatusState) -> R,
) -> R {
    let mut g = status.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_counters() {
        let counters = PlaybackCounters::default();
        counters.add_bytes_encoded(4096);
        counters.add_bytes_played(1024);
        counters.record_underrun(256);
        counters.record_underrun(128);

        let mut state = SessionStatusState::default();
        state.begin_cycle(7, counters);
        let snap = state.snapshot();
        assert_eq!(snap.state, SessionState::Playing);
        assert_eq!(snap.generation, 7);
        assert_eq!(snap.bytes_encoded, 4096);
        assert_eq!(snap.bytes_played, 1024);
        assert_eq!(snap.underrun_events, 2);
        assert_eq!(snap.underrun_frames, 384);
    }

    #[test]
    fn begin_cycle_clears_previous_end_reason() {
        let mut state = SessionStatusState::default();
        state.end_reason = Some(PlaybackEndReason::Error);
        state.begin_cycle(2, PlaybackCounters::default());
        assert!(state.end_reason.is_none());
        assert_eq!(state.snapshot().bytes_played, 0);
    }

    #[test]
    fn snapshot_without_cycle_is_zeroed() {
        let snap = SessionStatusState::default().snapshot();
        assert_eq!(snap.state, SessionState::Idle);
        assert_eq!(snap.bytes_encoded, 0);
        assert!(snap.device.is_none());
    }
}
