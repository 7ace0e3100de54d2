//! Codec collaborator: application bytes in, PCM bytes out.
//!
//! The session only relies on the [`Codec`] contract. [`tone::ToneCodec`] is the built-in
//! implementation used by the CLI.

pub mod tone;

use std::io::{self, Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use tone_bridge_types::ProtocolId;

use crate::cancel::CancelToken;
use crate::config::SessionConfig;
use crate::format::{CodecSampleFormat, NegotiatedFormat};

pub use tone::ToneCodec;

/// Parameters for one encode call, derived from the session config and negotiated format.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodeParams {
    pub protocol: ProtocolId,
    pub volume_percent: u8,
    pub sample_rate: u32,
    pub sample_format: CodecSampleFormat,
    pub samples_per_frame: usize,
    /// Max input bytes per transmission.
    pub max_payload_bytes: usize,
    /// Sleep between polls while the input has no data yet.
    pub input_poll: Duration,
}

impl EncodeParams {
    pub fn new(config: &SessionConfig, format: &NegotiatedFormat) -> Self {
        Self {
            protocol: config.protocol,
            volume_percent: config.volume_percent.min(100),
            sample_rate: format.codec_rate,
            sample_format: format.codec_format,
            samples_per_frame: config.samples_per_frame,
            max_payload_bytes: config.max_payload_bytes.max(4),
            input_poll: config.input_poll(),
        }
    }
}

/// How a streaming encode ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// Input reached end-of-stream and everything was encoded.
    Completed,
    /// Cancellation was observed at a read/write boundary.
    Cancelled,
}

/// Summary of a streaming encode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeReport {
    pub outcome: EncodeOutcome,
    /// Transmissions produced.
    pub payloads: u64,
    pub input_bytes: u64,
    pub pcm_bytes: u64,
}

impl EncodeReport {
    fn new() -> Self {
        Self {
            outcome: EncodeOutcome::Completed,
            payloads: 0,
            input_bytes: 0,
            pcm_bytes: 0,
        }
    }

    fn finish(mut self, outcome: EncodeOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Byte ↔ PCM codec.
pub trait Codec: Send + Sync {
    /// Encode `payload` as one transmission.
    fn encode(&self, payload: &[u8], params: &EncodeParams) -> Result<Vec<u8>>;

    /// Decode one transmission from a bounded PCM buffer produced by [`encode`](Self::encode).
    fn decode(&self, pcm: &[u8], params: &EncodeParams) -> Result<Vec<u8>>;

    /// Pull bytes from `source` and push one transmission per chunk into `sink`.
    ///
    /// `Ok(0)` from `source` ends the stream. [`io::ErrorKind::WouldBlock`] means "no data
    /// yet": it is retried every `params.input_poll` when `wait_for_more_input` is set and
    /// treated as end of input otherwise. `cancel` is checked before every read and write.
    fn encode_stream(
        &self,
        source: &mut dyn Read,
        sink: &mut dyn Write,
        params: &EncodeParams,
        wait_for_more_input: bool,
        cancel: &CancelToken,
    ) -> Result<EncodeReport> {
        let cap = params.max_payload_bytes.max(4);
        let mut chunk: Vec<u8> = Vec::with_capacity(cap);
        let mut buf = vec![0u8; cap];
        let mut report = EncodeReport::new();
        let mut eof = false;

        while !eof {
            if cancel.is_cancelled() {
                return Ok(report.finish(EncodeOutcome::Cancelled));
            }
            let room = cap - chunk.len();
            match source.read(&mut buf[..room]) {
                Ok(0) => eof = true,
                Ok(n) => {
                    chunk.extend_from_slice(&buf[..n]);
                    report.input_bytes += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !wait_for_more_input {
                        eof = true;
                    } else if utf8_prefix_len(&chunk) == 0 {
                        std::thread::sleep(params.input_poll);
                        continue;
                    }
                }
                Err(e) => return Err(e).context("read encoder input"),
            }

            // Keep a trailing partial UTF-8 sequence for the next transmission.
            let take = if eof {
                chunk.len()
            } else {
                utf8_prefix_len(&chunk)
            };
            if take == 0 {
                continue;
            }

            let pcm = self
                .encode(&chunk[..take], params)
                .context("encode transmission")?;
            if cancel.is_cancelled() {
                return Ok(report.finish(EncodeOutcome::Cancelled));
            }
            sink.write_all(&pcm).context("write encoded pcm")?;
            chunk.drain(..take);
            report.payloads += 1;
            report.pcm_bytes += pcm.len() as u64;
            tracing::debug!(
                payload_bytes = take,
                pcm_bytes = pcm.len(),
                "transmission encoded"
            );
        }

        sink.flush().context("flush encoded pcm")?;
        Ok(report.finish(EncodeOutcome::Completed))
    }
}

/// Length of the longest prefix of `bytes` that does not end inside a UTF-8 sequence.
///
/// Only the trailing (at most 3) bytes are inspected; invalid data passes through unchanged.
fn utf8_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = if b & 0b1110_0000 == 0b1100_0000 {
            2
        } else if b & 0b1111_0000 == 0b1110_0000 {
            3
        } else if b & 0b1111_1000 == 0b1111_0000 {
            4
        } else {
            1
        };
        return if needed > back { len - back } else { len };
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use crate::pipe::stream_pipe;
    use std::sync::Mutex;

    /// Codec that frames each payload as `[len, payload...]`.
    struct EchoCodec {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl EchoCodec {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Codec for EchoCodec {
        fn encode(&self, payload: &[u8], _params: &EncodeParams) -> Result<Vec<u8>> {
            self.seen.lock().unwrap().push(payload.to_vec());
            let mut out = vec![payload.len() as u8];
            out.extend_from_slice(payload);
            Ok(out)
        }

        fn decode(&self, pcm: &[u8], _params: &EncodeParams) -> Result<Vec<u8>> {
            Ok(pcm[1..].to_vec())
        }
    }

    fn params(max_payload_bytes: usize) -> EncodeParams {
        EncodeParams {
            protocol: ProtocolId::AudibleFastest,
            volume_percent: 30,
            sample_rate: 48_000,
            sample_format: CodecSampleFormat::I16,
            samples_per_frame: 1024,
            max_payload_bytes,
            input_poll: Duration::from_millis(1),
        }
    }

    #[test]
    fn utf8_prefix_keeps_incomplete_tail() {
        let text = "Превед".as_bytes();
        assert_eq!(utf8_prefix_len(text), text.len());
        assert_eq!(utf8_prefix_len(&text[..3]), 2);
        assert_eq!(utf8_prefix_len(b"abc"), 3);
        assert_eq!(utf8_prefix_len(&"a€".as_bytes()[..3]), 1);
        assert_eq!(utf8_prefix_len(&[]), 0);
    }

    #[test]
    fn stream_chunks_input_without_splitting_characters() {
        let codec = EchoCodec::new();
        let mut source: &[u8] = "ааааа".as_bytes();
        let mut sink = Vec::new();
        let report = codec
            .encode_stream(&mut source, &mut sink, &params(5), false, &CancelToken::never())
            .unwrap();
        assert_eq!(report.outcome, EncodeOutcome::Completed);
        assert_eq!(report.input_bytes, 10);
        let seen = codec.seen.lock().unwrap();
        assert!(seen.iter().all(|p| std::str::from_utf8(p).is_ok()));
        assert_eq!(seen.concat(), "ааааа".as_bytes());
    }

    #[test]
    fn stream_waits_for_late_input_until_close() {
        let codec = EchoCodec::new();
        let (mut w, mut r) = stream_pipe();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            w.write(b"late");
            w.close();
        });
        let mut sink = Vec::new();
        let report = codec
            .encode_stream(&mut r, &mut sink, &params(16), true, &CancelToken::never())
            .unwrap();
        writer.join().unwrap();
        assert_eq!(report.outcome, EncodeOutcome::Completed);
        assert_eq!(sink, b"\x04late");
    }

    #[test]
    fn stream_without_wait_treats_pending_as_end() {
        let codec = EchoCodec::new();
        let (_w, mut r) = stream_pipe();
        let mut sink = Vec::new();
        let report = codec
            .encode_stream(&mut r, &mut sink, &params(16), false, &CancelToken::never())
            .unwrap();
        assert_eq!(report.outcome, EncodeOutcome::Completed);
        assert_eq!(report.payloads, 0);
    }

    #[test]
    fn stream_observes_cancel_while_waiting() {
        let codec = EchoCodec::new();
        let (_w, mut r) = stream_pipe();
        let source = CancelSource::new(3);
        let token = source.token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            source.cancel();
        });
        let mut sink = Vec::new();
        let report = codec
            .encode_stream(&mut r, &mut sink, &params(16), true, &token)
            .unwrap();
        canceller.join().unwrap();
        assert_eq!(report.outcome, EncodeOutcome::Cancelled);
        assert!(sink.is_empty());
    }
}
