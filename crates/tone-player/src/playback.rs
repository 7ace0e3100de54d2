//! Playback stage (pipe → CPAL output stream).
//!
//! [`PcmSource`] turns pipe bytes into whole mono samples for the device callback. The
//! callback:
//! - pulls bytes from the pipe without blocking (or with a short bounded wait, per policy)
//! - duplicates the mono signal to every device channel
//! - converts `f32` samples to the device sample format
//!
//! "No data yet" is an underrun, filled with silence. Only an explicit close of the write
//! side, observed after the tail has been drained, ends playback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;
use crossbeam_channel::Sender;
use serde::Deserialize;

use crate::device::DeviceEvent;
use crate::format::PcmFormat;
use crate::pipe::{ReadHandle, ReadStatus};
use crate::status::PlaybackCounters;

/// What to do when the pipe has no bytes for the device yet.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShortReadPolicy {
    /// Fill the rest of the buffer with silence right away.
    #[default]
    Silence,
    /// Wait up to `attempts` × `interval_us` for more bytes, then fill with silence.
    Poll { attempts: u32, interval_us: u64 },
}

/// Outcome of filling one device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillStatus {
    /// Every requested sample came from the pipe.
    Full,
    /// Only `filled` samples were ready; the rest is silence.
    Underrun { filled: usize },
    /// The stream is closed and drained after `filled` samples.
    Ended { filled: usize },
}

/// Raw PCM reader over a pipe's read side.
pub struct PcmSource {
    reader: ReadHandle,
    format: PcmFormat,
    policy: ShortReadPolicy,
    counters: PlaybackCounters,
    carry: Vec<u8>,
    scratch: Vec<u8>,
    ended: bool,
}

impl PcmSource {
    pub fn new(
        reader: ReadHandle,
        format: PcmFormat,
        policy: ShortReadPolicy,
        counters: PlaybackCounters,
    ) -> Self {
        Self {
            reader,
            format,
            policy,
            counters,
            carry: Vec::new(),
            scratch: Vec::new(),
            ended: false,
        }
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Fill `out` with mono samples; anything not backed by pipe data is `0.0`.
    pub fn fill(&mut self, out: &mut [f32]) -> FillStatus {
        let width = self.format.sample_format.bytes_per_sample();
        let mut filled = 0usize;
        let mut attempts_left = match self.policy {
            ShortReadPolicy::Silence => 0,
            ShortReadPolicy::Poll { attempts, .. } => attempts,
        };

        while filled < out.len() && !self.ended {
            let want = (out.len() - filled) * width - self.carry.len();
            self.scratch.resize(want, 0);
            match self.reader.read_into(&mut self.scratch) {
                ReadStatus::Data(n) => {
                    self.counters.add_bytes_played(n as u64);
                    self.carry.extend_from_slice(&self.scratch[..n]);
                    let whole = self.carry.len() / width * width;
                    for sample in self.carry[..whole].chunks_exact(width) {
                        out[filled] = self.format.sample_format.read_sample(sample);
                        filled += 1;
                    }
                    self.carry.drain(..whole);
                }
                ReadStatus::Pending => {
                    if attempts_left == 0 {
                        break;
                    }
                    attempts_left -= 1;
                    if let ShortReadPolicy::Poll { interval_us, .. } = self.policy {
                        self.reader.wait_for_data(Duration::from_micros(interval_us));
                    }
                }
                ReadStatus::EndOfStream => {
                    // A dangling partial sample at the very end is dropped.
                    self.carry.clear();
                    self.ended = true;
                }
            }
        }

        out[filled..].fill(0.0);
        if self.ended {
            FillStatus::Ended { filled }
        } else if filled < out.len() {
            self.counters
                .record_underrun((out.len() - filled) as u64);
            FillStatus::Underrun { filled }
        } else {
            FillStatus::Full
        }
    }
}

/// Build a CPAL output stream that plays `source` on `device`.
///
/// `stop_reported` gates the single [`DeviceEvent::Stopped`] per stream: it is shared with the
/// owner so an explicit stop and a natural end cannot both report.
pub(crate) fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    source: PcmSource,
    events: Sender<DeviceEvent>,
    stop_reported: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(device, config, source, events, stop_reported)
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(device, config, source, events, stop_reported)
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(device, config, source, events, stop_reported)
        }
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut source: PcmSource,
    events: Sender<DeviceEvent>,
    stop_reported: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = (config.channels as usize).max(1);
    let mut mono: Vec<f32> = Vec::new();

    let events_err = events.clone();
    let reported_err = stop_reported.clone();
    let err_fn = move |err: cpal::StreamError| {
        tracing::warn!("stream error: {err}");
        if !reported_err.swap(true, Ordering::AcqRel) {
            let _ = events_err.send(DeviceEvent::Stopped {
                error: Some(err.to_string()),
            });
        }
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / channels_out;
            mono.resize(frames, 0.0);
            let status = source.fill(&mut mono);

            for (frame, &sample) in data.chunks_exact_mut(channels_out).zip(mono.iter()) {
                frame.fill(<T as cpal::Sample>::from_sample::<f32>(sample));
            }

            if let FillStatus::Ended { .. } = status {
                if !stop_reported.swap(true, Ordering::AcqRel) {
                    let _ = events.send(DeviceEvent::Stopped { error: None });
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::negotiate;
    use crate::pipe::stream_pipe;

    fn i16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn source(reader: ReadHandle, policy: ShortReadPolicy) -> (PcmSource, PlaybackCounters) {
        let format = negotiate(cpal::SampleFormat::I16, 48_000).unwrap().pcm;
        let counters = PlaybackCounters::default();
        (PcmSource::new(reader, format, policy, counters.clone()), counters)
    }

    #[test]
    fn full_buffer_when_data_is_ready() {
        let (mut w, r) = stream_pipe();
        w.write(&i16_bytes(&[i16::MAX, 0, i16::MIN + 1, 0]));
        let (mut src, counters) = source(r, ShortReadPolicy::Silence);

        let mut out = [9.0f32; 4];
        assert_eq!(src.fill(&mut out), FillStatus::Full);
        assert!((out[0] - 1.0).abs() < 1e-4);
        assert!((out[2] + 1.0).abs() < 1e-4);
        assert_eq!(counters.snapshot().bytes_played, 8);
    }

    #[test]
    fn pending_pipe_is_silence_not_end() {
        let (mut w, r) = stream_pipe();
        w.write(&i16_bytes(&[1000]));
        let (mut src, counters) = source(r, ShortReadPolicy::Silence);

        let mut out = [9.0f32; 4];
        assert_eq!(src.fill(&mut out), FillStatus::Underrun { filled: 1 });
        assert_eq!(&out[1..], &[0.0, 0.0, 0.0]);
        assert!(!src.is_ended());
        let snap = counters.snapshot();
        assert_eq!(snap.underrun_events, 1);
        assert_eq!(snap.underrun_frames, 3);
    }

    #[test]
    fn data_arriving_late_is_still_played() {
        let (mut w, r) = stream_pipe();
        let (mut src, _) = source(r, ShortReadPolicy::Silence);

        let mut out = [0.0f32; 2];
        assert_eq!(src.fill(&mut out), FillStatus::Underrun { filled: 0 });

        w.write(&i16_bytes(&[i16::MAX, i16::MAX]));
        assert_eq!(src.fill(&mut out), FillStatus::Full);
        assert!(out.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn poll_policy_waits_for_late_data() {
        let (mut w, r) = stream_pipe();
        let (mut src, counters) = source(
            r,
            ShortReadPolicy::Poll {
                attempts: 200,
                interval_us: 5_000,
            },
        );
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            w.write(&i16_bytes(&[5, 6, 7]));
            w
        });

        let mut out = [0.0f32; 3];
        assert_eq!(src.fill(&mut out), FillStatus::Full);
        assert_eq!(counters.snapshot().underrun_events, 0);
        let _w = writer.join().unwrap();
    }

    #[test]
    fn stream_ending_early_reports_end_with_partial_fill() {
        let (mut w, r) = stream_pipe();
        w.write(&i16_bytes(&[100, 200]));
        w.close();
        let (mut src, counters) = source(r, ShortReadPolicy::Silence);

        let mut out = [9.0f32; 4];
        assert_eq!(src.fill(&mut out), FillStatus::Ended { filled: 2 });
        assert_eq!(&out[2..], &[0.0, 0.0]);
        assert!(src.is_ended());
        assert_eq!(src.fill(&mut out), FillStatus::Ended { filled: 0 });
        assert_eq!(counters.snapshot().underrun_events, 0);
    }

    #[test]
    fn split_sample_bytes_are_carried_over() {
        let (mut w, r) = stream_pipe();
        let bytes = i16_bytes(&[i16::MAX, i16::MAX]);
        w.write(&bytes[..3]);
        let (mut src, _) = source(r, ShortReadPolicy::Silence);

        let mut out = [0.0f32; 2];
        assert_eq!(src.fill(&mut out), FillStatus::Underrun { filled: 1 });
        w.write(&bytes[3..]);
        let mut one = [0.0f32; 1];
        assert_eq!(src.fill(&mut one), FillStatus::Full);
        assert!((one[0] - 1.0).abs() < 1e-4);
    }
}
