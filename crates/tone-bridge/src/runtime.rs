//! CLI runtime: device selection and the encode-and-play loop.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tone_player::codec::ToneCodec;
use tone_player::device::{self, CpalOutput, DeviceCapabilities};
use tone_player::pipe::stream_pipe;
use tone_player::{CycleOutcome, EncodeSession, SessionResult};

use crate::config::BridgeConfig;

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)?;
    Ok(())
}

/// Select a device, start a session and play `--text` or stdin lines.
pub fn run(config: BridgeConfig) -> Result<()> {
    let host = cpal::default_host();
    let caps = match config.device {
        Some(index) => select_device(&device::list_capabilities(&host)?, index)?,
        None => prompt_for_device(&host, &mut io::stdin().lock())?,
    };
    println!("Selected output device: {}", caps.name);

    let index = caps.index;
    let latency_ms = config.session.latency_ms;
    let session = Arc::new(EncodeSession::spawn(
        move || CpalOutput::open(index, latency_ms),
        ToneCodec,
        config.session.clone(),
    )?);

    let for_signal = Arc::downgrade(&session);
    let _ = ctrlc::set_handler(move || {
        if let Some(session) = for_signal.upgrade() {
            if let Err(e) = session.stop() {
                tracing::warn!("stop on interrupt failed: {e}");
            }
        }
        std::process::exit(130);
    });

    match config.text {
        Some(text) => play_text(&session, text),
        None => play_lines(&session, io::stdin().lock()),
    }
}

fn prompt_for_device(host: &cpal::Host, input: &mut impl BufRead) -> Result<DeviceCapabilities> {
    let caps = device::list_devices(host)?;
    print!("Select output device number: ");
    io::stdout().flush().context("flush prompt")?;
    let mut answer = String::new();
    input.read_line(&mut answer).context("read device number")?;
    select_device(&caps, parse_device_answer(&answer)?)
}

/// Empty answer picks the first device.
fn parse_device_answer(answer: &str) -> Result<usize> {
    let trimmed = answer.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse()
        .with_context(|| format!("invalid device number {trimmed:?}"))
}

fn select_device(caps: &[DeviceCapabilities], index: usize) -> Result<DeviceCapabilities> {
    let selected = caps
        .get(index)
        .ok_or_else(|| anyhow!("No output device at index {index} ({} available)", caps.len()))?;
    if !selected.is_valid {
        bail!("Audio capabilities are not valid ({selected})");
    }
    Ok(selected.clone())
}

fn play_text(session: &EncodeSession, text: String) -> Result<()> {
    let handle = session.encode_and_play(io::Cursor::new(text.into_bytes()))?;
    tracing::info!(generation = handle.generation(), "message queued");
    finish(session, handle.wait())
}

/// Stream stdin lines into one cycle; the device plays silence between lines.
fn play_lines(session: &EncodeSession, input: impl BufRead) -> Result<()> {
    let (mut writer, reader) = stream_pipe();
    let handle = session.encode_and_play(reader)?;
    println!("Type a message and press Enter to send it. End input (Ctrl-D) to finish.");

    for line in input.lines() {
        let line = line.context("read stdin")?;
        if let Some(result) = handle.wait_timeout(Duration::ZERO) {
            return finish(session, result);
        }
        if line.trim().is_empty() {
            continue;
        }
        writer.write(line.as_bytes());
        writer.write(b"\n");
        tracing::debug!(bytes = line.len() + 1, total = writer.position(), "line queued");
    }

    writer.close();
    finish(session, handle.wait())
}

fn finish(session: &EncodeSession, result: SessionResult<CycleOutcome>) -> Result<()> {
    let outcome = result.context("playback failed")?;
    let status = session.status();
    tracing::info!(
        outcome = ?outcome,
        bytes_encoded = status.bytes_encoded,
        bytes_played = status.bytes_played,
        underrun_events = status.underrun_events,
        underrun_frames = status.underrun_frames,
        "playback finished"
    );
    Ok(())
}
