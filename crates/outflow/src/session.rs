//! # Output Session
//!
//! The connection state machine. Owns the worker threads and everything
//! they share.
//!
//! ```text
//!          start()          connected + headers sent
//!   Idle ──────────► Connecting ──────────────────────► Active
//!    ▲                   │                              │    │
//!    │      failure      │        write failure         │    │ stop()
//!    ├──── Disconnected ◄┴──────────────────────────────┘    ▼
//!    │                                                    Stopping
//!    └───────────────── drained or deadline elapsed ─────────┘
//! ```
//!
//! Threads:
//!
//! - caller thread(s): [`OutputSession::send_packet`] runs the drop policy
//!   and bitrate controller under the packet lock, then posts one wake token
//! - `outflow-connect`: one-shot; handshake, metadata, stream headers
//! - `outflow-send`: long-lived; one packet per wake token, drains on stop
//! - `outflow-socket`: only in buffered socket mode, see [`crate::socket_writer`]
//!
//! The send worker blocks on the token channel and a control channel at the
//! same time, so a stop wakes it immediately even with nothing queued.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use quanta::Instant;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bitrate::{BitrateCommand, BitrateController};
use crate::buffer::PacketBuffer;
use crate::config::OutputConfig;
use crate::drop_policy::{Admission, DropController};
use crate::encoder::EncoderSet;
use crate::error::{OutputError, WriterError};
use crate::estimator::{ideal_buffer_capacity, StrainEstimator};
use crate::packet::{MediaKind, OutboundPacket};
use crate::serializer::Serializer;
use crate::shutdown::ShutdownSignal;
use crate::socket_writer::{BufferedSocketWriter, WriterGauge};
use crate::stats::OutputStats;
use crate::transport::{AbortHandle, Transport};

/// Extra time `stop()` waits beyond the drain deadline for the send worker
/// to close the transport and report back.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

// ─── State / Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Active,
    Stopping,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications delivered on [`OutputSession::events`].
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Handshake done and headers sent; packets are now accepted.
    Connected,
    /// The session ended on a fatal condition.
    Disconnected(OutputError),
    /// A user-requested stop drained successfully.
    Stopped,
}

/// What happened to a packet handed to [`OutputSession::send_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Rejected by the drop policy. Counted, not an error.
    Dropped,
    /// No active session; the packet was released.
    Inactive,
}

/// Creates a fresh, unconnected transport for each connect attempt.
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

enum Control {
    Stop,
}

// ─── Shared State ───────────────────────────────────────────────────────────

/// Everything guarded by the packet lock: the buffer, the drop policy and the
/// bitrate controller, plus the wake side of the token channel.
struct PacketState {
    buffer: PacketBuffer,
    drops: DropController,
    bitrate: Option<BitrateController>,
    /// `Some` exactly while packets are accepted.
    wake: Option<Sender<()>>,
}

#[derive(Default)]
struct Workers {
    connect: Option<JoinHandle<()>>,
    send: Option<JoinHandle<()>>,
    control: Option<Sender<Control>>,
    done: Option<Receiver<Result<(), OutputError>>>,
    /// Fired by `stop()` when the send worker is stuck past the deadline.
    abort: Option<Arc<dyn AbortHandle>>,
}

struct Shared {
    config: OutputConfig,
    factory: TransportFactory,
    serializer: Arc<dyn Serializer>,
    encoders: EncoderSet,
    state: Mutex<ConnectionState>,
    packets: Mutex<PacketState>,
    estimator: Arc<StrainEstimator>,
    shutdown: Arc<ShutdownSignal>,
    writer_gauge: Mutex<Option<WriterGauge>>,
    total_bytes_sent: AtomicU64,
    workers: Mutex<Workers>,
    events: Sender<OutputEvent>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(from = %*state, to = %next, "state transition");
            *state = next;
        }
    }

    fn packets(&self) -> MutexGuard<'_, PacketState> {
        self.packets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: OutputEvent) {
        let _ = self.events.send(event);
    }

    fn max_shutdown_secs(&self) -> u64 {
        self.config.max_shutdown.as_secs()
    }

    fn congestion(&self) -> f64 {
        if self.config.buffered_socket_mode {
            let gauge = self.writer_gauge.lock().unwrap_or_else(|e| e.into_inner());
            return gauge.as_ref().map_or(0.0, |g| g.fill_ratio());
        }
        if self.packets().drops.gate_active() {
            1.0
        } else {
            self.estimator.average_strain()
        }
    }

    fn stats(&self) -> OutputStats {
        let state = self.state();
        let (buffered_packets, buffered_bytes, dropped_frames, bitrate) = {
            let p = self.packets();
            (
                p.buffer.len(),
                p.buffer.payload_bytes(),
                p.drops.dropped_frames(),
                p.bitrate.as_ref().map(|b| (b.current_kbps(), b.target_kbps())),
            )
        };
        OutputStats {
            state,
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            dropped_frames,
            buffered_packets,
            buffered_bytes,
            congestion: self.congestion(),
            current_bitrate_kbps: bitrate.map(|(current, _)| current),
            target_bitrate_kbps: bitrate.map(|(_, target)| target),
            average_strain: self.estimator.average_strain(),
            throughput_bps: self.estimator.average_throughput(),
        }
    }
}

// ─── Sink ───────────────────────────────────────────────────────────────────

/// Where framed bytes go: straight to the transport, or through the
/// buffered socket writer.
enum Sink {
    Direct(Box<dyn Transport>),
    Buffered(BufferedSocketWriter),
}

impl Sink {
    fn write_all(&mut self, data: &[u8], shared: &Shared) -> Result<(), OutputError> {
        match self {
            Sink::Direct(transport) => transport.write_all(data).map_err(OutputError::from),
            Sink::Buffered(writer) => writer
                .enqueue_bytes(data)
                .map_err(|e| writer_error(e, writer.gauge().used(), shared)),
        }
    }

    fn is_direct(&self) -> bool {
        matches!(self, Sink::Direct(_))
    }

    fn discard_incoming(&mut self) -> Result<(), OutputError> {
        if let Sink::Direct(transport) = self {
            let discarded = transport.discard_incoming()?;
            if discarded > 0 {
                debug!(discarded, "discarded inbound bytes");
            }
        }
        Ok(())
    }

    /// Close the connection. With `flush`, buffered socket bytes are written
    /// out first, bounded by the drain deadline.
    fn close(self, flush: bool, shared: &Shared) -> Result<(), OutputError> {
        match self {
            Sink::Direct(mut transport) => {
                transport.close();
                Ok(())
            }
            Sink::Buffered(mut writer) => {
                let (transport, result) = writer.shutdown(flush);
                if let Some(mut transport) = transport {
                    transport.close();
                }
                result.map_err(|e| writer_error(e, writer.gauge().used(), shared))
            }
        }
    }
}

/// `ring_bytes` is what the socket ring still holds; at a drain deadline
/// that is usually everything left unsent.
fn writer_error(err: WriterError, ring_bytes: usize, shared: &Shared) -> OutputError {
    match err {
        WriterError::DeadlineElapsed => {
            let p = shared.packets();
            OutputError::ShutdownTimeout {
                seconds: shared.max_shutdown_secs(),
                remaining: p.buffer.len(),
                unsent_bytes: p.buffer.payload_bytes() + ring_bytes,
            }
        }
        other => OutputError::TransportWriteFailed(other.to_string()),
    }
}

/// Frame and write one packet. Returns the number of bytes handed over.
fn write_packet(
    shared: &Shared,
    sink: &mut Sink,
    packet: &OutboundPacket,
    is_header: bool,
) -> Result<usize, OutputError> {
    let framed = shared.serializer.frame_message(&packet.header()?, is_header)?;
    sink.write_all(&framed, shared)?;
    sink.write_all(&packet.payload, shared)?;

    let sent = framed.len() + packet.size();
    shared.total_bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
    shared.estimator.record_send(sent, Instant::now());
    Ok(sent)
}

// ─── Session ────────────────────────────────────────────────────────────────

/// One logical outbound stream.
///
/// Dropping the session stops it, draining buffered packets within
/// `max_shutdown`.
pub struct OutputSession {
    shared: Arc<Shared>,
    events: Receiver<OutputEvent>,
}

impl OutputSession {
    pub fn new(
        config: OutputConfig,
        factory: TransportFactory,
        serializer: Arc<dyn Serializer>,
        encoders: EncoderSet,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        let drops = DropController::new(config.thresholds);
        let shared = Arc::new(Shared {
            config,
            factory,
            serializer,
            encoders,
            state: Mutex::new(ConnectionState::Idle),
            packets: Mutex::new(PacketState {
                buffer: PacketBuffer::new(),
                drops,
                bitrate: None,
                wake: None,
            }),
            estimator: Arc::new(StrainEstimator::default()),
            shutdown: Arc::new(ShutdownSignal::new()),
            writer_gauge: Mutex::new(None),
            total_bytes_sent: AtomicU64::new(0),
            workers: Mutex::new(Workers::default()),
            events: events_tx,
        });
        OutputSession {
            shared,
            events: events_rx,
        }
    }

    /// Lifecycle events. Every fatal condition arrives here with its reason.
    pub fn events(&self) -> Receiver<OutputEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn config(&self) -> &OutputConfig {
        &self.shared.config
    }

    /// Begin connecting in the background. Valid only from `Idle`.
    pub fn start(&self) -> Result<(), OutputError> {
        self.shared.config.validate()?;
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ConnectionState::Idle {
                return Err(OutputError::InvalidState(*state));
            }
            *state = ConnectionState::Connecting;
        }

        let mut workers = self.shared.workers();
        // Reap the threads of a previous session; they have already finished.
        if let Some(handle) = workers.connect.take() {
            let _ = handle.join();
        }
        if let Some(handle) = workers.send.take() {
            let _ = handle.join();
        }
        workers.control = None;
        workers.done = None;
        workers.abort = None;

        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("outflow-connect".into())
            .spawn(move || connect_worker(shared))
        {
            Ok(handle) => {
                workers.connect = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Idle);
                Err(OutputError::SpawnFailed(e.to_string()))
            }
        }
    }

    /// Hand a packet to the output.
    ///
    /// Audio is always queued. Video goes through the drop policy and, with
    /// autotuning, the bitrate controller; a resulting bitrate change is
    /// delivered to the video encoder after the packet lock is released.
    pub fn send_packet(&self, packet: OutboundPacket) -> SendOutcome {
        let shared = &self.shared;
        let mut command: Option<BitrateCommand> = None;

        let outcome = {
            let mut guard = shared.packets();
            let p = &mut *guard;
            let Some(wake) = p.wake.as_ref() else {
                return SendOutcome::Inactive;
            };

            let admitted = match packet.kind {
                MediaKind::Audio => {
                    p.buffer.push_back(packet);
                    true
                }
                MediaKind::Video => {
                    let dropped = p.drops.check(&mut p.buffer).is_some_and(|o| o.dropped > 0);
                    if let Some(bitrate) = p.bitrate.as_mut() {
                        let buffered = p.buffer.span_to(packet.dts_usec);
                        command = bitrate.on_video_packet(
                            packet.correlation_id,
                            buffered,
                            dropped,
                            &shared.estimator,
                            Instant::now(),
                        );
                    }
                    p.drops.admit(&mut p.buffer, packet) == Admission::Queued
                }
            };

            if admitted {
                let _ = wake.send(());
                SendOutcome::Queued
            } else {
                SendOutcome::Dropped
            }
        };

        if let Some(cmd) = command {
            shared
                .encoders
                .video
                .update_bitrate(cmd.bitrate_kbps, cmd.correlation_id);
        }
        outcome
    }

    /// Stop the session.
    ///
    /// From `Active`, buffered packets are drained for at most
    /// `max_shutdown`. Remaining packets at the deadline abort the connection
    /// and the call reports [`OutputError::ShutdownTimeout`]. From any other
    /// state this is a no-op once a pending connect attempt has finished.
    pub fn stop(&self) -> Result<(), OutputError> {
        let connect = self.shared.workers().connect.take();
        if let Some(handle) = connect {
            let _ = handle.join();
        }

        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ConnectionState::Active {
                return Ok(());
            }
            *state = ConnectionState::Stopping;
        }

        let max = self.shared.config.max_shutdown;
        info!(max_shutdown_secs = max.as_secs(), "stopping output, draining buffered packets");
        self.shared.shutdown.begin(Instant::now() + max);
        self.shared.packets().wake = None;

        let (control, done, send, abort) = {
            let mut workers = self.shared.workers();
            (
                workers.control.take(),
                workers.done.take(),
                workers.send.take(),
                workers.abort.take(),
            )
        };
        if let Some(control) = control {
            let _ = control.send(Control::Stop);
        }
        let Some(done) = done else {
            return Ok(());
        };

        match done.recv_timeout(max + SHUTDOWN_GRACE) {
            Ok(result) => {
                if let Some(handle) = send {
                    let _ = handle.join();
                }
                result
            }
            Err(_) => {
                // The worker is stuck in a transport write. Abort the
                // connection so the write fails and the worker winds down.
                if let Some(abort) = abort {
                    warn!(
                        seconds = max.as_secs(),
                        "send worker stuck past the drain deadline, aborting connection"
                    );
                    abort.abort();
                    if let Ok(result) = done.recv_timeout(SHUTDOWN_GRACE) {
                        if let Some(handle) = send {
                            let _ = handle.join();
                        }
                        return result;
                    }
                }

                // Not interruptible. Leave the worker to finish on its own;
                // it moves the state back to Idle when it does.
                let (remaining, unsent_bytes) = {
                    let p = self.shared.packets();
                    (p.buffer.len(), p.buffer.payload_bytes())
                };
                warn!(
                    seconds = max.as_secs(),
                    remaining, "send worker did not finish draining, detaching"
                );
                self.shared.set_state(ConnectionState::Disconnected);
                Err(OutputError::ShutdownTimeout {
                    seconds: max.as_secs(),
                    remaining,
                    unsent_bytes,
                })
            }
        }
    }

    /// Congestion estimate in `0.0..=1.0`.
    ///
    /// Buffered socket mode reports write-ring occupancy. Otherwise an active
    /// priority gate reads as fully congested, else the average strain.
    pub fn congestion(&self) -> f64 {
        self.shared.congestion()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.shared.packets().drops.dropped_frames()
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.shared.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn buffered_packets(&self) -> usize {
        self.shared.packets().buffer.len()
    }

    pub fn stats(&self) -> OutputStats {
        self.shared.stats()
    }

    /// A cheap handle for reading stats from other threads, e.g. a
    /// [`crate::metrics::MetricsServer`].
    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for OutputSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "output did not stop cleanly");
        }
    }
}

#[derive(Clone)]
pub struct StatsHandle {
    shared: Arc<Shared>,
}

impl StatsHandle {
    pub fn snapshot(&self) -> OutputStats {
        self.shared.stats()
    }
}

// ─── Connect Worker ─────────────────────────────────────────────────────────

fn connect_worker(shared: Arc<Shared>) {
    if let Err(err) = establish(&shared) {
        error!(destination = %shared.config.destination, error = %err, "connection failed");
        shared.set_state(ConnectionState::Disconnected);
        shared.emit(OutputEvent::Disconnected(err));
        shared.set_state(ConnectionState::Idle);
    }
}

fn establish(shared: &Arc<Shared>) -> Result<(), OutputError> {
    {
        let mut p = shared.packets();
        let stale = p.buffer.clear();
        if stale > 0 {
            debug!(stale, "released packets from previous session");
        }
        p.drops.reset();
        p.bitrate = None;
        p.wake = None;
    }
    shared.estimator.reset();
    shared.shutdown.clear();

    let config = &shared.config;
    info!(destination = %config.destination, "connecting");
    let mut transport = (shared.factory)();
    transport
        .connect(&config.connect_target())
        .map_err(|e| e.into_connect_error())?;
    info!(destination = %config.destination, "connection established");
    let abort = transport.abort_handle();

    let video_kbps = shared.encoders.video.bitrate_kbps();
    let audio_kbps = shared.encoders.audio_bitrate_kbps();
    let target_kbps = config
        .target_bitrate
        .or((video_kbps > 0).then_some(video_kbps));
    let current_kbps = if video_kbps > 0 {
        video_kbps
    } else {
        target_kbps.unwrap_or(0)
    };

    let autotune = match target_kbps {
        Some(_) if config.autotune_enabled && !shared.encoders.video.can_update() => {
            warn!("bitrate autotuning disabled: video encoder cannot change bitrate");
            None
        }
        None if config.autotune_enabled => {
            warn!("bitrate autotuning disabled: no target or encoder bitrate known");
            None
        }
        Some(target) if config.autotune_enabled => Some(target),
        _ => None,
    };

    let capacity = ideal_buffer_capacity(current_kbps + audio_kbps);
    shared.estimator.set_target_capacity(capacity);

    let mut sink = if config.buffered_socket_mode {
        transport
            .set_nonblocking(true)
            .map_err(|e| e.into_connect_error())?;
        let writer = BufferedSocketWriter::start(
            transport,
            capacity,
            shared.estimator.clone(),
            shared.shutdown.clone(),
        )?;
        Sink::Buffered(writer)
    } else {
        Sink::Direct(transport)
    };

    if let Err(err) = send_preamble(shared, &mut sink) {
        let _ = sink.close(false, shared);
        return Err(err);
    }

    let (wake_tx, wake_rx) = unbounded();
    let (control_tx, control_rx) = unbounded();
    let (done_tx, done_rx) = bounded(1);

    let gauge = match &sink {
        Sink::Buffered(writer) => Some(writer.gauge()),
        Sink::Direct(_) => None,
    };

    let worker_shared = shared.clone();
    let handle = thread::Builder::new()
        .name("outflow-send".into())
        .spawn(move || send_worker(worker_shared, sink, wake_rx, control_rx, done_tx))
        .map_err(|e| OutputError::SpawnFailed(e.to_string()))?;

    *shared.writer_gauge.lock().unwrap_or_else(|e| e.into_inner()) = gauge;
    {
        let mut p = shared.packets();
        p.bitrate = autotune
            .map(|target| BitrateController::new(current_kbps, target, audio_kbps, Instant::now()));
        p.wake = Some(wake_tx);
    }
    {
        let mut workers = shared.workers();
        workers.send = Some(handle);
        workers.control = Some(control_tx);
        workers.done = Some(done_rx);
        workers.abort = abort;
    }

    if let Some(target) = autotune {
        info!(current_kbps, target_kbps = target, audio_kbps, "bitrate autotuning enabled");
    }
    shared.set_state(ConnectionState::Active);
    shared.emit(OutputEvent::Connected);
    info!(buffered_socket = config.buffered_socket_mode, "output active");
    Ok(())
}

/// Metadata for every track the serializer knows about, then the stream
/// headers: first audio track, the video track, remaining audio tracks.
fn send_preamble(shared: &Shared, sink: &mut Sink) -> Result<(), OutputError> {
    let mut track = 0;
    while let Some(metadata) = shared.serializer.metadata(track) {
        sink.write_all(&metadata, shared)?;
        shared
            .total_bytes_sent
            .fetch_add(metadata.len() as u64, Ordering::Relaxed);
        track += 1;
    }

    let encoders = &shared.encoders;
    let serializer = &shared.serializer;
    let mut headers = Vec::with_capacity(1 + encoders.audio.len());
    if let Some(first) = encoders.audio.first() {
        headers.push(serializer.header_packet(MediaKind::Audio, 0, first.as_ref()));
    }
    headers.push(serializer.header_packet(MediaKind::Video, 0, encoders.video.as_ref()));
    for (idx, audio) in encoders.audio.iter().enumerate().skip(1) {
        headers.push(serializer.header_packet(MediaKind::Audio, idx, audio.as_ref()));
    }

    for header in &headers {
        write_packet(shared, sink, header, true)?;
    }
    debug!(metadata = track, headers = headers.len(), "stream headers sent");
    Ok(())
}

// ─── Send Worker ────────────────────────────────────────────────────────────

fn send_worker(
    shared: Arc<Shared>,
    mut sink: Sink,
    wake: Receiver<()>,
    control: Receiver<Control>,
    done: Sender<Result<(), OutputError>>,
) {
    let result = send_loop(&shared, &mut sink, &wake, &control);
    finish(&shared, sink, result, &done);
}

fn send_loop(
    shared: &Shared,
    sink: &mut Sink,
    wake: &Receiver<()>,
    control: &Receiver<Control>,
) -> Result<(), OutputError> {
    loop {
        select! {
            recv(wake) -> token => match token {
                Ok(()) => {
                    send_next(shared, sink)?;
                }
                Err(_) => return drain(shared, sink),
            },
            recv(control) -> msg => match msg {
                Ok(Control::Stop) | Err(_) => return drain(shared, sink),
            },
        }
    }
}

/// Pop and write one packet. Returns `false` when the buffer was empty.
fn send_next(shared: &Shared, sink: &mut Sink) -> Result<bool, OutputError> {
    let (packet, pending) = {
        let mut p = shared.packets();
        match p.buffer.pop_front() {
            Some(packet) => (packet, p.buffer.payload_bytes()),
            None => return Ok(false),
        }
    };

    sink.discard_incoming()?;
    write_packet(shared, sink, &packet, false)?;

    if sink.is_direct() {
        let capacity = shared.estimator.target_capacity();
        shared.estimator.record_strain(pending, capacity, Instant::now());
    }
    Ok(true)
}

/// Write out whatever is still buffered, giving up at the deadline.
fn drain(shared: &Shared, sink: &mut Sink) -> Result<(), OutputError> {
    loop {
        if shared.shutdown.expired(Instant::now()) {
            let (remaining, unsent_bytes) = {
                let p = shared.packets();
                (p.buffer.len(), p.buffer.payload_bytes())
            };
            if remaining > 0 {
                let seconds = shared.max_shutdown_secs();
                warn!(
                    "took longer than {} second(s) to shut down, {} packet(s) unsent",
                    seconds, remaining
                );
                return Err(OutputError::ShutdownTimeout {
                    seconds,
                    remaining,
                    unsent_bytes,
                });
            }
        }
        if !send_next(shared, sink)? {
            return Ok(());
        }
    }
}

fn finish(
    shared: &Shared,
    sink: Sink,
    result: Result<(), OutputError>,
    done: &Sender<Result<(), OutputError>>,
) {
    let closed = sink.close(result.is_ok(), shared);
    let result = result.and(closed);
    if result.is_err() {
        shared.set_state(ConnectionState::Disconnected);
    }

    // Closing the intake and releasing the backlog happen under one guard so
    // no packet can slip in between.
    let result = {
        let mut p = shared.packets();
        p.wake = None;
        p.bitrate = None;
        match result {
            Ok(()) => {
                info!("user stopped the stream");
                Ok(())
            }
            Err(err) => {
                let remaining = p.buffer.len();
                let unsent_bytes = p.buffer.payload_bytes();
                let freed = p.buffer.clear();
                if freed > 0 {
                    info!(freed, "freed remaining packets");
                }
                // A write cut short by an abort past the drain deadline is a
                // shutdown timeout, not a link failure.
                let err = match err {
                    OutputError::TransportWriteFailed(_) if shared.shutdown.expired(Instant::now()) => {
                        OutputError::ShutdownTimeout {
                            seconds: shared.max_shutdown_secs(),
                            remaining,
                            unsent_bytes,
                        }
                    }
                    other => other,
                };
                error!(error = %err, "disconnected");
                Err(err)
            }
        }
    };
    *shared.writer_gauge.lock().unwrap_or_else(|e| e.into_inner()) = None;
    shared.shutdown.clear();
    shared.set_state(ConnectionState::Idle);

    shared.emit(match &result {
        Ok(()) => OutputEvent::Stopped,
        Err(err) => OutputEvent::Disconnected(err.clone()),
    });
    let _ = done.send(result);
}
