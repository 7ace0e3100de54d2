//! Encode-and-play session.
//!
//! One control-loop thread owns the output device and the codec. Callers talk to it through
//! [`EncodeSession`] commands; the device and the encoder report back over channels, so no
//! callback ever re-enters session state.
//!
//! ## Cycle lifecycle
//! `Idle → Playing → Stopping → Idle`
//! - `encode_and_play` negotiates the format, creates a fresh pipe and cancel source, attaches
//!   the pipe's read side to the device, starts the encoder thread and the device.
//! - The device reports `Stopped` when the encoder has closed the pipe and the tail is drained,
//!   when asked to stop, or on a fault.
//! - After `Stopped`, the session waits the settle delay (device buffers may still be sounding)
//!   and then goes idle, resolving the cycle's [`CycleHandle`].

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use tone_bridge_types::{PlaybackEndReason, SessionState, SessionStatus};

use crate::cancel::{CancelSource, CancelToken};
use crate::codec::{Codec, EncodeParams, EncodeReport};
use crate::config::SessionConfig;
use crate::device::{DeviceCapabilities, DeviceEvent, OutputDevice};
use crate::error::{SessionError, SessionResult};
use crate::format::{NegotiatedFormat, negotiate};
use crate::pipe::{WriteHandle, stream_pipe};
use crate::playback::PcmSource;
use crate::status::{PlaybackCounters, SessionStatusState, with_status};

/// How a cycle ended when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Input exhausted and everything encoded was played.
    Completed,
    /// Stopped on request before the input was exhausted.
    Cancelled,
}

/// Completion handle for one encode-and-play cycle.
#[derive(Debug)]
pub struct CycleHandle {
    generation: u64,
    done: Receiver<SessionResult<CycleOutcome>>,
}

impl CycleHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Block until the cycle is idle again.
    pub fn wait(self) -> SessionResult<CycleOutcome> {
        self.done.recv().unwrap_or(Err(SessionError::SessionClosed))
    }

    /// Wait up to `timeout`; `None` if the cycle is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<SessionResult<CycleOutcome>> {
        match self.done.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Some(Err(SessionError::SessionClosed))
            }
        }
    }
}

enum SessionCommand {
    EncodeAndPlay {
        source: Box<dyn Read + Send>,
        reply: Sender<SessionResult<CycleHandle>>,
    },
    Stop {
        reply: Sender<()>,
    },
    Shutdown,
}

/// Handle to a session control loop bound to one output device.
///
/// Dropping the handle stops any active cycle and releases the device and codec.
pub struct EncodeSession {
    cmd_tx: Sender<SessionCommand>,
    status: Arc<Mutex<SessionStatusState>>,
    format: NegotiatedFormat,
    join: Option<thread::JoinHandle<()>>,
}

impl EncodeSession {
    /// Start a session.
    ///
    /// `make_device` runs on the session thread (CPAL streams are bound to the thread that
    /// builds them). The device format is negotiated before this returns, so an unsupported
    /// device fails here without any encode work.
    pub fn spawn<D, F, C>(make_device: F, codec: C, config: SessionConfig) -> SessionResult<Self>
    where
        D: OutputDevice + 'static,
        F: FnOnce() -> anyhow::Result<D> + Send + 'static,
        C: Codec + 'static,
    {
        let config = config.normalized();
        let status = SessionStatusState::shared();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let codec: Arc<dyn Codec> = Arc::new(codec);
        let status_for_loop = status.clone();

        let join = thread::Builder::new()
            .name("encode-session".to_string())
            .spawn(move || {
                let device = match make_device() {
                    Ok(d) => d,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SessionError::device(e)));
                        return;
                    }
                };
                let format = match negotiate_for(device.capabilities()) {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                tracing::info!(
                    device = %device.capabilities().name,
                    rate_hz = format.codec_rate,
                    codec_format = format.codec_format.as_str(),
                    bits = format.pcm.bits_per_sample,
                    protocol = %config.protocol,
                    volume = config.volume_percent,
                    "session format negotiated"
                );
                with_status(&status_for_loop, |s| {
                    s.device = Some(device.capabilities().name.clone());
                    s.sample_rate = Some(format.codec_rate);
                    s.sample_format = Some(format.codec_format.as_str().to_string());
                });
                let _ = ready_tx.send(Ok(format));
                SessionLoop::new(device, codec, config, status_for_loop).run(cmd_rx);
            })
            .map_err(|e| SessionError::Device(format!("spawn session thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(format)) => Ok(Self {
                cmd_tx,
                status,
                format,
                join: Some(join),
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(SessionError::SessionClosed)
            }
        }
    }

    /// Start encoding `source` and playing the result.
    ///
    /// Fails with [`SessionError::SessionAlreadyActive`] while another cycle is not idle.
    pub fn encode_and_play(
        &self,
        source: impl Read + Send + 'static,
    ) -> SessionResult<CycleHandle> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(SessionCommand::EncodeAndPlay {
                source: Box::new(source),
                reply,
            })
            .map_err(|_| SessionError::SessionClosed)?;
        rx.recv().unwrap_or(Err(SessionError::SessionClosed))
    }

    /// Stop the active cycle and block until the session is idle. No-op when idle.
    pub fn stop(&self) -> SessionResult<()> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(SessionCommand::Stop { reply })
            .map_err(|_| SessionError::SessionClosed)?;
        rx.recv().map_err(|_| SessionError::SessionClosed)
    }

    pub fn state(&self) -> SessionState {
        with_status(&self.status, |s| s.state)
    }

    pub fn status(&self) -> SessionStatus {
        with_status(&self.status, |s| s.snapshot())
    }

    /// Format negotiated when the session started.
    pub fn format(&self) -> &NegotiatedFormat {
        &self.format
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn negotiate_for(caps: &DeviceCapabilities) -> SessionResult<NegotiatedFormat> {
    if !caps.is_valid {
        return Err(SessionError::Device(format!(
            "audio capabilities are not valid ({caps})"
        )));
    }
    let native = caps.native_format.ok_or_else(|| SessionError::UnsupportedFormat {
        format: "unknown".to_string(),
    })?;
    negotiate(native, caps.frequency)
}

#[derive(Clone, Copy, Debug)]
enum CyclePhase {
    Playing,
    /// Device told to stop; waiting for its `Stopped` event.
    AwaitingStop { deadline: Instant },
    /// Device stopped; idle once `until` passes.
    Settling { until: Instant },
}

impl CyclePhase {
    fn timer(self) -> Receiver<Instant> {
        match self {
            CyclePhase::Playing => crossbeam_channel::never(),
            CyclePhase::AwaitingStop { deadline } => crossbeam_channel::at(deadline),
            CyclePhase::Settling { until } => crossbeam_channel::at(until),
        }
    }
}

struct ActiveCycle {
    generation: u64,
    cancel: CancelSource,
    events: Receiver<DeviceEvent>,
    encoder: Option<Receiver<anyhow::Result<EncodeReport>>>,
    done: Sender<SessionResult<CycleOutcome>>,
    phase: CyclePhase,
    stop_requested: bool,
    fault: Option<SessionError>,
    report: Option<EncodeReport>,
    stop_waiters: Vec<Sender<()>>,
}

struct SessionLoop<D: OutputDevice> {
    device: D,
    codec: Arc<dyn Codec>,
    config: SessionConfig,
    status: Arc<Mutex<SessionStatusState>>,
    generation: u64,
    cycle: Option<ActiveCycle>,
}

impl<D: OutputDevice> SessionLoop<D> {
    fn new(
        device: D,
        codec: Arc<dyn Codec>,
        config: SessionConfig,
        status: Arc<Mutex<SessionStatusState>>,
    ) -> Self {
        Self {
            device,
            codec,
            config,
            status,
            generation: 0,
            cycle: None,
        }
    }

    fn run(mut self, cmd_rx: Receiver<SessionCommand>) {
        loop {
            // Settled cycles stop listening to the device: its senders may already be gone.
            let (events, encoder, timer) = match self.cycle.as_ref() {
                Some(c) => (
                    match c.phase {
                        CyclePhase::Settling { .. } => crossbeam_channel::never(),
                        _ => c.events.clone(),
                    },
                    c.encoder.clone().unwrap_or_else(crossbeam_channel::never),
                    c.phase.timer(),
                ),
                None => (
                    crossbeam_channel::never(),
                    crossbeam_channel::never(),
                    crossbeam_channel::never(),
                ),
            };

            select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(SessionCommand::EncodeAndPlay { source, reply }) => {
                        let result = self.start_cycle(source);
                        let _ = reply.send(result);
                    }
                    Ok(SessionCommand::Stop { reply }) => self.request_stop(reply),
                    Ok(SessionCommand::Shutdown) | Err(_) => break,
                },
                recv(events) -> ev => match ev {
                    Ok(DeviceEvent::Stopped { error }) => self.on_device_stopped(error),
                    Err(_) => self.on_device_stopped(Some(
                        "device closed its event channel without reporting a stop".to_string(),
                    )),
                },
                recv(encoder) -> res => self.on_encoder_done(res.unwrap_or_else(|_| {
                    Err(anyhow::anyhow!("encoder thread exited unexpectedly"))
                })),
                recv(timer) -> _ => self.on_timer(),
            }
        }
        self.shutdown();
    }

    fn start_cycle(&mut self, source: Box<dyn Read + Send>) -> SessionResult<CycleHandle> {
        self.reap_if_settled();
        if self.cycle.is_some() {
            return Err(SessionError::SessionAlreadyActive);
        }

        let format = negotiate_for(self.device.capabilities())?;
        let generation = self.generation + 1;
        let cancel = CancelSource::new(generation);
        let counters = PlaybackCounters::default();
        let (writer, reader) = stream_pipe();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let pcm = PcmSource::new(reader, format.pcm, self.config.short_read, counters.clone());
        self.device
            .init(pcm, events_tx)
            .map_err(SessionError::device)?;

        let params = EncodeParams::new(&self.config, &format);
        let encoder = match spawn_encoder(
            self.codec.clone(),
            source,
            writer,
            params,
            cancel.token(),
            counters.clone(),
        ) {
            Ok(rx) => rx,
            Err(e) => {
                let _ = self.device.stop();
                return Err(e);
            }
        };

        if let Err(e) = self.device.play() {
            cancel.cancel();
            let _ = self.device.stop();
            return Err(SessionError::device(e));
        }

        self.generation = generation;
        with_status(&self.status, |s| s.begin_cycle(generation, counters));
        tracing::info!(generation, "playback started");

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.cycle = Some(ActiveCycle {
            generation,
            cancel,
            events: events_rx,
            encoder: Some(encoder),
            done: done_tx,
            phase: CyclePhase::Playing,
            stop_requested: false,
            fault: None,
            report: None,
            stop_waiters: Vec::new(),
        });
        Ok(CycleHandle {
            generation,
            done: done_rx,
        })
    }

    fn request_stop(&mut self, reply: Sender<()>) {
        let Some(cycle) = self.cycle.as_mut() else {
            let _ = reply.send(());
            return;
        };
        cycle.stop_waiters.push(reply);
        // Device already stopped: the cycle keeps its outcome and idles after the settle delay.
        if let CyclePhase::Settling { .. } = cycle.phase {
            return;
        }
        if !cycle.stop_requested {
            cycle.stop_requested = true;
            tracing::info!(generation = cycle.generation, "stop requested");
            self.halt();
        }
    }

    /// Raise cancellation and tell the device to stop, once per cycle.
    fn halt(&mut self) {
        let stop_timeout = self.config.stop_timeout();
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        cycle.cancel.cancel();
        if let CyclePhase::Playing = cycle.phase {
            cycle.phase = CyclePhase::AwaitingStop {
                deadline: Instant::now() + stop_timeout,
            };
            with_status(&self.status, |s| s.state = SessionState::Stopping);
            if let Err(e) = self.device.stop() {
                tracing::warn!("device stop failed: {e:#}");
            }
        }
    }

    fn on_device_stopped(&mut self, error: Option<String>) {
        let settle = self.config.settle_delay();
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        match &error {
            Some(err) => {
                tracing::warn!(
                    generation = cycle.generation,
                    error = %err,
                    "playback stopped with device fault"
                );
                cycle.fault.get_or_insert(SessionError::DeviceFault(err.clone()));
                cycle.cancel.cancel();
            }
            None => tracing::info!(generation = cycle.generation, "playback stopped"),
        }
        cycle.phase = CyclePhase::Settling {
            until: Instant::now() + settle,
        };
        with_status(&self.status, |s| s.state = SessionState::Stopping);
        // Stopped at end of stream leaves the stream running on silence until told otherwise.
        if let Err(e) = self.device.stop() {
            tracing::warn!("device stop failed: {e:#}");
        }
    }

    fn on_encoder_done(&mut self, result: anyhow::Result<EncodeReport>) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        cycle.encoder = None;
        match result {
            Ok(report) => {
                tracing::info!(
                    generation = cycle.generation,
                    outcome = ?report.outcome,
                    payloads = report.payloads,
                    input_bytes = report.input_bytes,
                    pcm_bytes = report.pcm_bytes,
                    "encoding finished"
                );
                cycle.report = Some(report);
            }
            Err(e) => {
                tracing::warn!(generation = cycle.generation, "encoder failed: {e:#}");
                cycle.fault.get_or_insert(SessionError::codec(e));
                self.halt();
            }
        }
    }

    fn on_timer(&mut self) {
        let settle = self.config.settle_delay();
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        let phase = cycle.phase;
        match phase {
            CyclePhase::AwaitingStop { .. } => {
                tracing::warn!(
                    generation = cycle.generation,
                    "device did not confirm stop; forcing idle after settle delay"
                );
                cycle.phase = CyclePhase::Settling {
                    until: Instant::now() + settle,
                };
            }
            CyclePhase::Settling { until } if Instant::now() >= until => self.finish_cycle(),
            _ => {}
        }
    }

    fn reap_if_settled(&mut self) {
        let settled = matches!(
            self.cycle.as_ref().map(|c| c.phase),
            Some(CyclePhase::Settling { until }) if Instant::now() >= until
        );
        if settled {
            self.finish_cycle();
        }
    }

    fn finish_cycle(&mut self) {
        let Some(mut cycle) = self.cycle.take() else {
            return;
        };
        if let Some(encoder) = cycle.encoder.take() {
            match encoder.try_recv() {
                Ok(Ok(report)) => cycle.report = Some(report),
                Ok(Err(e)) => {
                    cycle.fault.get_or_insert(SessionError::codec(e));
                }
                Err(_) => tracing::debug!(
                    generation = cycle.generation,
                    "encoder still unwinding at cycle end"
                ),
            }
        }
        let (result, end_reason) = match (cycle.fault, cycle.stop_requested) {
            (Some(fault), _) => (Err(fault), PlaybackEndReason::Error),
            (None, true) => (Ok(CycleOutcome::Cancelled), PlaybackEndReason::Stopped),
            (None, false) => (Ok(CycleOutcome::Completed), PlaybackEndReason::Eof),
        };
        let snapshot = with_status(&self.status, |s| {
            s.state = SessionState::Idle;
            s.end_reason = Some(end_reason);
            s.snapshot()
        });
        tracing::info!(
            generation = cycle.generation,
            end_reason = ?end_reason,
            payloads = cycle.report.map(|r| r.payloads).unwrap_or(0),
            bytes_encoded = snapshot.bytes_encoded,
            bytes_played = snapshot.bytes_played,
            underrun_events = snapshot.underrun_events,
            underrun_frames = snapshot.underrun_frames,
            "cycle finished"
        );
        let _ = cycle.done.send(result);
        for waiter in cycle.stop_waiters {
            let _ = waiter.send(());
        }
    }

    fn shutdown(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            cycle.cancel.cancel();
            if let Err(e) = self.device.stop() {
                tracing::warn!("device stop failed: {e:#}");
            }
            with_status(&self.status, |s| {
                s.state = SessionState::Idle;
                s.end_reason = Some(PlaybackEndReason::Stopped);
            });
            let _ = cycle.done.send(Err(SessionError::Cancelled));
            for waiter in cycle.stop_waiters {
                let _ = waiter.send(());
            }
        }
        tracing::debug!("session loop exited");
    }
}

/// Counts PCM bytes on their way into the pipe.
struct CountingWriter {
    inner: WriteHandle,
    counters: PlaybackCounters,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = Write::write(&mut self.inner, buf)?;
        self.counters.add_bytes_encoded(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.inner)
    }
}

/// Run the codec on its own thread; the result arrives on the returned channel.
fn spawn_encoder(
    codec: Arc<dyn Codec>,
    mut source: Box<dyn Read + Send>,
    writer: WriteHandle,
    params: EncodeParams,
    cancel: CancelToken,
    counters: PlaybackCounters,
) -> SessionResult<Receiver<anyhow::Result<EncodeReport>>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let generation = cancel.generation();
    thread::Builder::new()
        .name(format!("encoder-{generation}"))
        .spawn(move || {
            tracing::info!(generation, "encoding thread start");
            let mut sink = CountingWriter {
                inner: writer,
                counters,
            };
            let result = codec.encode_stream(&mut source, &mut sink, &params, true, &cancel);
            // End of data for the device, whatever the outcome.
            sink.inner.close();
            tracing::info!(generation, ok = result.is_ok(), "encoding thread end");
            let _ = tx.send(result);
        })
        .map_err(|e| SessionError::Codec(format!("spawn encoder thread: {e}")))?;
    Ok(rx)
}
