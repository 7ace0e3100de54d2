//! Output device discovery and the device collaborator.
//!
//! - [`list_capabilities`] enumerates output devices with their native format and rate
//! - [`OutputDevice`] is the push-mode renderer the session drives
//! - [`CpalOutput`] implements it on top of a CPAL output stream

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;

use crate::playback::{self, PcmSource};

/// Output device metadata used for selection and format negotiation.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceCapabilities {
    /// Position in the host's output device list.
    pub index: usize,
    pub id: String,
    pub name: String,
    /// Sample format of the device's default output config.
    pub native_format: Option<cpal::SampleFormat>,
    /// Default output sample rate in Hz (0 when unknown).
    pub frequency: u32,
    pub channels: u16,
    /// `false` when the device's output config could not be queried.
    pub is_valid: bool,
}

impl std::fmt::Display for DeviceCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let format = self
            .native_format
            .map(|s| format!("{s:?}"))
            .unwrap_or_else(|| "unknown".to_string());
        write!(
            f,
            "#{}: {} [{format}, {} Hz, {} ch{}]",
            self.index,
            self.name,
            self.frequency,
            self.channels,
            if self.is_valid { "" } else { ", invalid" }
        )
    }
}

/// Event posted by a device after [`OutputDevice::init`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Playback stopped, either on request, at end of stream, or because of a fault.
    Stopped { error: Option<String> },
}

/// Push-mode PCM renderer.
///
/// After `init`, the device posts exactly one [`DeviceEvent::Stopped`] on `events`: when
/// `stop` is called, when the source reports end of stream, or when the device faults.
/// Implementations need not be `Send`; sessions build them on their own thread.
pub trait OutputDevice {
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Attach a PCM source for the next playback.
    fn init(&mut self, source: PcmSource, events: Sender<DeviceEvent>) -> Result<()>;

    fn play(&mut self) -> Result<()>;

    /// Halt playback immediately. Safe to call when already stopped.
    fn stop(&mut self) -> Result<()>;
}

/// Enumerate output devices of `host` with their default output config.
pub fn list_capabilities(host: &cpal::Host) -> Result<Vec<DeviceCapabilities>> {
    let devices = host.output_devices().context("No output devices")?;
    Ok(devices
        .enumerate()
        .map(|(index, d)| capabilities_for(index, &d))
        .collect())
}

/// Print available output devices to stdout.
///
/// This is intended for CLI UX (`--list-devices`, device prompt) rather than structured output.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceCapabilities>> {
    let caps = list_capabilities(host)?;
    for c in &caps {
        println!("{c}");
    }
    Ok(caps)
}

fn capabilities_for(index: usize, device: &cpal::Device) -> DeviceCapabilities {
    let name = device
        .description()
        .map(|d| d.to_string())
        .unwrap_or_else(|_| format!("device {index}"));
    match device.default_output_config() {
        Ok(cfg) => {
            let frequency = cfg.sample_rate();
            DeviceCapabilities {
                index,
                id: device_id_for(device, &name, frequency),
                name,
                native_format: Some(cfg.sample_format()),
                frequency,
                channels: cfg.channels(),
                is_valid: frequency > 0 && cfg.channels() > 0,
            }
        }
        Err(e) => {
            tracing::warn!(device = %name, "output config query failed: {e}");
            DeviceCapabilities {
                index,
                id: device_id_for(device, &name, 0),
                name,
                native_format: None,
                frequency: 0,
                channels: 0,
                is_valid: false,
            }
        }
    }
}

fn device_id_for(device: &cpal::Device, name: &str, rate: u32) -> String {
    if let Ok(id) = device.id() {
        return id.to_string();
    }
    hash_device_id(name, rate)
}

fn hash_device_id(name: &str, rate: u32) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    let input = format!("{name}|{rate}");
    for b in input.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

/// Fixed buffer size for a latency target, clamped to the device range when known.
fn buffer_frames_for_latency(rate: u32, latency_ms: u32, range: Option<(u32, u32)>) -> Option<u32> {
    let (min, max) = range?;
    let target = (u64::from(rate) * u64::from(latency_ms) / 1000).max(1);
    let target = u32::try_from(target).unwrap_or(u32::MAX);
    Some(target.clamp(min, max.max(min)))
}

/// CPAL-backed [`OutputDevice`].
pub struct CpalOutput {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
    caps: DeviceCapabilities,
    latency_ms: u32,
    stream: Option<cpal::Stream>,
    stop_reported: Arc<AtomicBool>,
    events: Option<Sender<DeviceEvent>>,
}

impl CpalOutput {
    /// Open output device `index` on the default host.
    pub fn open(index: usize, latency_ms: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .output_devices()
            .context("No output devices")?
            .nth(index)
            .ok_or_else(|| anyhow!("No output device at index {index}"))?;
        let caps = capabilities_for(index, &device);
        if !caps.is_valid {
            return Err(anyhow!("Audio capabilities are not valid ({caps})"));
        }
        let config = device
            .default_output_config()
            .context("query default output config")?;
        tracing::info!(
            device = %caps.name,
            rate_hz = caps.frequency,
            channels = caps.channels,
            format = ?caps.native_format,
            "output device opened"
        );
        Ok(Self {
            device,
            config,
            caps,
            latency_ms,
            stream: None,
            stop_reported: Arc::new(AtomicBool::new(true)),
            events: None,
        })
    }

    fn stream_config(&self) -> cpal::StreamConfig {
        let mut stream_config: cpal::StreamConfig = self.config.clone().into();
        let range = match self.config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => Some((*min, *max)),
            cpal::SupportedBufferSize::Unknown => None,
        };
        if let Some(frames) =
            buffer_frames_for_latency(stream_config.sample_rate, self.latency_ms, range)
        {
            stream_config.buffer_size = cpal::BufferSize::Fixed(frames);
        }
        stream_config
    }
}

impl OutputDevice for CpalOutput {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn init(&mut self, source: PcmSource, events: Sender<DeviceEvent>) -> Result<()> {
        if self.stream.is_some() {
            self.stop()?;
        }
        let pcm = *source.format();
        if pcm.sample_rate != self.caps.frequency {
            return Err(anyhow!(
                "source rate {} Hz does not match device rate {} Hz",
                pcm.sample_rate,
                self.caps.frequency
            ));
        }
        let stream_config = self.stream_config();
        tracing::info!(
            rate_hz = stream_config.sample_rate,
            channels = stream_config.channels,
            buffer_size = ?stream_config.buffer_size,
            "device output config"
        );
        let stop_reported = Arc::new(AtomicBool::new(false));
        let stream = playback::build_output_stream(
            &self.device,
            &stream_config,
            self.config.sample_format(),
            source,
            events.clone(),
            stop_reported.clone(),
        )
        .context("build output stream")?;
        self.stream = Some(stream);
        self.stop_reported = stop_reported;
        self.events = Some(events);
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| anyhow!("output device not initialized"))?;
        stream.play().context("start output stream")?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::warn!("stream pause failed: {e}");
            }
            drop(stream);
        }
        if !self.stop_reported.swap(true, Ordering::AcqRel) {
            if let Some(events) = self.events.take() {
                let _ = events.send(DeviceEvent::Stopped { error: None });
            }
        }
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
