//! Device format negotiation.
//!
//! Maps a device's native sample format and rate to:
//! - the sample format/rate the codec must emit
//! - the PCM container (bit depth, mono, rate) the playback adapter reads from the pipe
//!
//! Only unsigned 16-bit, signed 16-bit and 32-bit float devices are supported; anything
//! else is rejected before an encoder is started.

use crate::error::{SessionError, SessionResult};

/// Sample representation the codec writes into the pipe (little-endian, mono).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodecSampleFormat {
    U16,
    I16,
    F32,
}

impl CodecSampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            CodecSampleFormat::U16 | CodecSampleFormat::I16 => 2,
            CodecSampleFormat::F32 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CodecSampleFormat::U16 => "u16",
            CodecSampleFormat::I16 => "i16",
            CodecSampleFormat::F32 => "f32",
        }
    }

    /// Append one sample in `[-1.0, 1.0]` to `out`.
    pub fn push_sample(self, sample: f32, out: &mut Vec<u8>) {
        let s = sample.clamp(-1.0, 1.0);
        match self {
            CodecSampleFormat::U16 => {
                let v = ((s + 1.0) * 32767.5).round() as u16;
                out.extend_from_slice(&v.to_le_bytes());
            }
            CodecSampleFormat::I16 => {
                let v = (s * i16::MAX as f32).round() as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
            CodecSampleFormat::F32 => out.extend_from_slice(&s.to_le_bytes()),
        }
    }

    /// Decode one sample from exactly [`bytes_per_sample`](Self::bytes_per_sample) bytes.
    pub fn read_sample(self, bytes: &[u8]) -> f32 {
        match self {
            CodecSampleFormat::U16 => {
                let v = u16::from_le_bytes([bytes[0], bytes[1]]);
                v as f32 / 32767.5 - 1.0
            }
            CodecSampleFormat::I16 => {
                let v = i16::from_le_bytes([bytes[0], bytes[1]]);
                v as f32 / i16::MAX as f32
            }
            CodecSampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

/// How PCM sample values are encoded in the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmEncoding {
    Pcm,
    IeeeFloat,
}

/// Raw PCM container description used to interpret pipe bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    pub encoding: PcmEncoding,
    pub sample_format: CodecSampleFormat,
}

impl PcmFormat {
    /// Bytes per frame (all channels).
    pub fn block_align(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.block_align() * self.sample_rate as usize
    }
}

/// Result of negotiating a device format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiatedFormat {
    /// Sample format the codec must produce.
    pub codec_format: CodecSampleFormat,
    /// Input and output sample rate for the codec.
    pub codec_rate: u32,
    /// Container the device reads.
    pub pcm: PcmFormat,
}

/// Map a device's native format and rate to codec parameters and a mono PCM container.
pub fn negotiate(native: cpal::SampleFormat, rate_hz: u32) -> SessionResult<NegotiatedFormat> {
    let (codec_format, bits, encoding) = match native {
        cpal::SampleFormat::U16 => (CodecSampleFormat::U16, 16, PcmEncoding::Pcm),
        cpal::SampleFormat::I16 => (CodecSampleFormat::I16, 16, PcmEncoding::Pcm),
        cpal::SampleFormat::F32 => (CodecSampleFormat::F32, 32, PcmEncoding::IeeeFloat),
        other => {
            return Err(SessionError::UnsupportedFormat {
                format: format!("{other:?}"),
            });
        }
    };
    if rate_hz == 0 {
        return Err(SessionError::InvalidSampleRate { rate_hz });
    }
    Ok(NegotiatedFormat {
        codec_format,
        codec_rate: rate_hz,
        pcm: PcmFormat {
            sample_rate: rate_hz,
            bits_per_sample: bits,
            channels: 1,
            encoding,
            sample_format: codec_format,
        },
    })
}
