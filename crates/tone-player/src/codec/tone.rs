//! Built-in multi-tone FSK codec.
//!
//! Each byte is sent as two 4-bit symbols, one tone per symbol value. A transmission is:
//! lead silence, two start markers, payload symbols, a checksum byte, two end markers,
//! tail silence. Tones sit on a grid spaced two codec frames apart so a Goertzel detector
//! over one symbol separates them cleanly.

use std::f32::consts::PI;

use anyhow::{Result, anyhow, bail, ensure};
use tone_bridge_types::ProtocolId;

use super::{Codec, EncodeParams};

const DATA_TONES: usize = 16;
const START_TONE: usize = 16;
const END_TONE: usize = 17;
const TONE_COUNT: usize = 18;
const MARKER_REPEAT: usize = 2;
const AUDIBLE_BASE_HZ: f32 = 1875.0;
const ULTRASOUND_BASE_HZ: f32 = 15_000.0;
const SILENCE_POWER: f32 = 1e-6;

/// Stateless tone codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct ToneCodec;

/// Per-call tone layout derived from the params.
#[derive(Clone, Copy, Debug)]
struct ToneLayout {
    rate: f32,
    base_hz: f32,
    spacing_hz: f32,
    symbol_len: usize,
    lead_len: usize,
    ramp_len: usize,
}

impl ToneLayout {
    fn new(params: &EncodeParams) -> Result<Self> {
        ensure!(params.sample_rate > 0, "sample rate must be non-zero");
        ensure!(params.samples_per_frame > 0, "samples per frame must be non-zero");
        let rate = params.sample_rate as f32;
        let spacing_hz = 2.0 * rate / params.samples_per_frame as f32;
        let base_hz = if params.protocol.is_ultrasound() {
            ULTRASOUND_BASE_HZ
        } else {
            AUDIBLE_BASE_HZ
        };
        let top_hz = base_hz + spacing_hz * (TONE_COUNT - 1) as f32;
        if top_hz >= rate * 0.475 {
            bail!(
                "protocol {} needs {top_hz:.0} Hz, above the limit for {} Hz output",
                params.protocol,
                params.sample_rate
            );
        }
        let symbol_len = frames_per_symbol(params.protocol) * params.samples_per_frame;
        Ok(Self {
            rate,
            base_hz,
            spacing_hz,
            symbol_len,
            lead_len: params.samples_per_frame,
            ramp_len: (symbol_len / 8).min(64),
        })
    }

    fn tone_hz(&self, tone: usize) -> f32 {
        self.base_hz + self.spacing_hz * tone as f32
    }

    fn symbols_for(payload: &[u8]) -> Vec<usize> {
        let checksum = payload.iter().fold(0u8, |acc, b| acc ^ b);
        let mut symbols = vec![START_TONE; MARKER_REPEAT];
        for b in payload.iter().chain(std::iter::once(&checksum)) {
            symbols.push((b >> 4) as usize);
            symbols.push((b & 0x0f) as usize);
        }
        symbols.extend(std::iter::repeat_n(END_TONE, MARKER_REPEAT));
        symbols
    }

    fn render_symbol(&self, tone: usize, amplitude: f32, out: &mut Vec<f32>) {
        let step = 2.0 * PI * self.tone_hz(tone) / self.rate;
        for i in 0..self.symbol_len {
            let edge = i.min(self.symbol_len - 1 - i);
            let gain = if edge < self.ramp_len {
                0.5 - 0.5 * (PI * edge as f32 / self.ramp_len as f32).cos()
            } else {
                1.0
            };
            out.push(amplitude * gain * (step * i as f32).sin());
        }
    }

    /// Strongest tone in one symbol window, or `None` for silence.
    fn detect(&self, window: &[f32]) -> Option<usize> {
        let power: f32 = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
        if power < SILENCE_POWER {
            return None;
        }
        (0..TONE_COUNT)
            .map(|t| (t, goertzel_power(window, self.tone_hz(t), self.rate)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(t, _)| t)
    }
}

fn frames_per_symbol(protocol: ProtocolId) -> usize {
    match protocol {
        ProtocolId::AudibleNormal | ProtocolId::UltrasoundNormal => 4,
        ProtocolId::AudibleFast | ProtocolId::UltrasoundFast => 2,
        ProtocolId::AudibleFastest | ProtocolId::UltrasoundFastest => 1,
    }
}

fn goertzel_power(samples: &[f32], freq_hz: f32, rate: f32) -> f32 {
    let coeff = 2.0 * (2.0 * PI * freq_hz / rate).cos();
    let (mut s1, mut s2) = (0.0f32, 0.0f32);
    for &x in samples {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    s1 * s1 + s2 * s2 - coeff * s1 * s2
}

impl Codec for ToneCodec {
    fn encode(&self, payload: &[u8], params: &EncodeParams) -> Result<Vec<u8>> {
        ensure!(!payload.is_empty(), "empty payload");
        ensure!(
            payload.len() <= params.max_payload_bytes,
            "payload of {} bytes exceeds limit of {}",
            payload.len(),
            params.max_payload_bytes
        );
        let layout = ToneLayout::new(params)?;
        let amplitude = params.volume_percent.min(100) as f32 / 100.0;
        let symbols = ToneLayout::symbols_for(payload);

        let total = 2 * layout.lead_len + symbols.len() * layout.symbol_len;
        let mut samples = Vec::with_capacity(total);
        samples.resize(layout.lead_len, 0.0);
        for &tone in &symbols {
            layout.render_symbol(tone, amplitude, &mut samples);
        }
        samples.resize(total, 0.0);

        let mut out = Vec::with_capacity(total * params.sample_format.bytes_per_sample());
        for s in samples {
            params.sample_format.push_sample(s, &mut out);
        }
        Ok(out)
    }

    fn decode(&self, pcm: &[u8], params: &EncodeParams) -> Result<Vec<u8>> {
        let layout = ToneLayout::new(params)?;
        let width = params.sample_format.bytes_per_sample();
        let samples: Vec<f32> = pcm
            .chunks_exact(width)
            .map(|b| params.sample_format.read_sample(b))
            .collect();

        let mut symbols = samples
            .get(layout.lead_len..)
            .ok_or_else(|| anyhow!("pcm shorter than lead-in"))?
            .chunks_exact(layout.symbol_len)
            .map(|w| layout.detect(w));

        for _ in 0..MARKER_REPEAT {
            match symbols.next().flatten() {
                Some(START_TONE) => {}
                other => bail!("missing start marker (got {other:?})"),
            }
        }

        let mut nibbles = Vec::new();
        loop {
            match symbols.next() {
                Some(Some(END_TONE)) => break,
                Some(Some(t)) if t < DATA_TONES => nibbles.push(t as u8),
                Some(Some(t)) => bail!("unexpected marker tone {t} in payload"),
                Some(None) => bail!("signal lost after {} symbols", nibbles.len()),
                None => bail!("transmission truncated before end marker"),
            }
        }

        ensure!(
            nibbles.len() >= 4 && nibbles.len() % 2 == 0,
            "malformed payload of {} symbols",
            nibbles.len()
        );
        let mut bytes: Vec<u8> = nibbles.chunks_exact(2).map(|p| (p[0] << 4) | p[1]).collect();
        let checksum = bytes.pop().unwrap_or_default();
        let actual = bytes.iter().fold(0u8, |acc, b| acc ^ b);
        ensure!(
            checksum == actual,
            "checksum mismatch: expected {checksum:#04x}, got {actual:#04x}"
        );
        Ok(bytes)
    }
}
