//! # Outflow Node
//!
//! Streams synthetic audio/video packets to a remote ingest endpoint through
//! an [`OutputSession`]. Useful for exercising the drop policy and bitrate
//! autotuning against a real (or deliberately throttled) link.
//!
//! ## Usage
//!
//! ```bash
//! # Stream to a TCP listener using a config file
//! outflow-node --config outflow.toml
//!
//! # Override the destination, stop after 60s, expose Prometheus metrics
//! # (the config path can also come from OUTFLOW_CONFIG)
//! outflow-node --config outflow.toml --destination tcp://10.0.0.5:1935/live \
//!   --duration 60 --metrics-port 9100
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;

use outflow::config::OutputConfig;
use outflow::encoder::{Encoder, EncoderSet};
use outflow::metrics::MetricsServer;
use outflow::serializer::FramedSerializer;
use outflow::session::{OutputEvent, OutputSession, TransportFactory};
use outflow::transport::{TcpTransport, Transport};
use outflow::{DropPriority, OutboundPacket};

const AUDIO_KBPS: u32 = 128;
const GOP_FRAMES: u64 = 60;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI + config ──────────────────────────────────────
    let args = Cli::parse();
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read config '{}': {}", path, e))?;
            OutputConfig::from_toml_str(&text)?
        }
        None => OutputConfig::default(),
    };
    if let Some(dest) = &args.destination {
        config.destination = dest.clone();
    }

    tracing::info!(
        destination = %config.destination,
        bitrate_kbps = args.bitrate_kbps,
        fps = args.fps,
        autotune = config.autotune_enabled,
        buffered_socket = config.buffered_socket_mode,
        "outflow-node starting"
    );

    // ── Session ─────────────────────────────────────────────────
    let video = Arc::new(SyntheticEncoder::new(args.bitrate_kbps));
    let audio = Arc::new(SyntheticEncoder::new(AUDIO_KBPS));
    let encoders = EncoderSet::new(video.clone()).with_audio(audio);

    let connect_timeout = config.connect_timeout;
    let factory: TransportFactory =
        Arc::new(move || Box::new(TcpTransport::new(connect_timeout)) as Box<dyn Transport>);
    let session = OutputSession::new(config, factory, Arc::new(FramedSerializer::new()), encoders);
    let events = session.events();

    // ── Metrics server (optional) ───────────────────────────────
    let _metrics = match args.metrics_port {
        Some(port) => {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let stats = session.stats_handle();
            let server = MetricsServer::start(addr, move || stats.snapshot())?;
            tracing::info!(addr = %server.addr(), "metrics server listening");
            Some(server)
        }
        None => None,
    };

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    session.start()?;
    match events.recv_timeout(session.config().connect_timeout + Duration::from_secs(1)) {
        Ok(OutputEvent::Connected) => {}
        Ok(OutputEvent::Disconnected(err)) => return Err(err.into()),
        Ok(other) => anyhow::bail!("unexpected event while connecting: {other:?}"),
        Err(_) => anyhow::bail!("timed out waiting for connection"),
    }

    // ── Synthetic media loop ────────────────────────────────────
    let frame_interval = Duration::from_secs_f64(1.0 / args.fps as f64);
    let started = std::time::Instant::now();
    let mut last_stats_log = std::time::Instant::now();
    let stats_interval = Duration::from_secs(5);
    let mut frame: u64 = 0;

    while running.load(Ordering::Relaxed) {
        if args.duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        if let Ok(OutputEvent::Disconnected(err)) = events.try_recv() {
            tracing::error!(error = %err, "output disconnected");
            break;
        }

        let dts_usec = (frame as f64 * frame_interval.as_secs_f64() * 1_000_000.0) as i64;
        session.send_packet(video.next_frame(frame, dts_usec, args.fps));
        session.send_packet(OutboundPacket::audio(
            0,
            Bytes::from(vec![0u8; bytes_per_frame(AUDIO_KBPS, args.fps)]),
            dts_usec,
            dts_usec,
        ));
        frame += 1;

        if last_stats_log.elapsed() >= stats_interval {
            let stats = session.stats();
            tracing::info!(
                state = %stats.state,
                sent_bytes = stats.total_bytes_sent,
                dropped = stats.dropped_frames,
                buffered = stats.buffered_packets,
                congestion = stats.congestion,
                bitrate_kbps = video.bitrate_kbps(),
                "output stats"
            );
            last_stats_log = std::time::Instant::now();
        }

        let next = frame_interval.mul_f64(frame as f64);
        if let Some(wait) = next.checked_sub(started.elapsed()) {
            std::thread::sleep(wait);
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    let result = session.stop();
    let stats = session.stats();
    tracing::info!(
        frames = frame,
        sent_bytes = stats.total_bytes_sent,
        dropped = stats.dropped_frames,
        "outflow-node stopped"
    );
    result.map_err(Into::into)
}

fn bytes_per_frame(kbps: u32, fps: u32) -> usize {
    (kbps as usize * 1000 / 8 / fps.max(1) as usize).max(1)
}

// ─── Synthetic Encoder ──────────────────────────────────────────────────────

/// Produces fixed-size frames at its current bitrate and honors bitrate
/// updates on the next frame, stamping the correlation id there.
struct SyntheticEncoder {
    bitrate_kbps: AtomicU32,
    /// Zero when no change is waiting to be stamped.
    pending_correlation: AtomicU64,
}

impl SyntheticEncoder {
    fn new(bitrate_kbps: u32) -> Self {
        SyntheticEncoder {
            bitrate_kbps: AtomicU32::new(bitrate_kbps),
            pending_correlation: AtomicU64::new(0),
        }
    }

    fn next_frame(&self, frame: u64, dts_usec: i64, fps: u32) -> OutboundPacket {
        let size = bytes_per_frame(self.bitrate_kbps(), fps);
        let priority = match frame % 3 {
            0 => DropPriority::High,
            _ => DropPriority::Low,
        };
        let mut packet = OutboundPacket::video(Bytes::from(vec![0u8; size]), dts_usec, dts_usec, priority);
        if frame % GOP_FRAMES == 0 {
            packet = packet.with_keyframe();
        }
        match self.pending_correlation.swap(0, Ordering::Relaxed) {
            0 => packet,
            id => packet.with_correlation_id(id),
        }
    }
}

impl Encoder for SyntheticEncoder {
    fn bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps.load(Ordering::Relaxed)
    }

    fn extra_data(&self) -> Bytes {
        Bytes::from_static(b"synthetic")
    }

    fn update_bitrate(&self, kbps: u32, correlation_id: u64) {
        self.bitrate_kbps.store(kbps, Ordering::Relaxed);
        self.pending_correlation.store(correlation_id, Ordering::Relaxed);
    }
}

// ─── CLI ────────────────────────────────────────────────────────────────────

/// Stream synthetic media through an outflow session.
#[derive(Parser, Debug)]
#[command(name = "outflow-node", about = "Stream synthetic media through an outflow session")]
struct Cli {
    /// TOML config file.
    #[arg(short, long, env = "OUTFLOW_CONFIG")]
    config: Option<String>,

    /// Override the configured destination.
    #[arg(short, long)]
    destination: Option<String>,

    /// Serve Prometheus metrics on this port.
    #[arg(short, long)]
    metrics_port: Option<u16>,

    /// Stop after this many seconds.
    #[arg(long, value_parser = parse_secs)]
    duration: Option<Duration>,

    /// Initial video bitrate in kbps.
    #[arg(short, long = "bitrate", default_value_t = 2500)]
    bitrate_kbps: u32,

    /// Video frame rate.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..))]
    fps: u32,
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("invalid duration '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_apply_without_flags() {
        let cli = Cli::try_parse_from(["outflow-node", "--config", "out.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("out.toml"));
        assert_eq!(cli.bitrate_kbps, 2500);
        assert_eq!(cli.fps, 30);
        assert!(cli.duration.is_none());
        assert!(cli.metrics_port.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cli = Cli::try_parse_from([
            "outflow-node",
            "-d",
            "tcp://10.0.0.5:1935/live",
            "--duration",
            "60",
            "--metrics-port",
            "9100",
            "--bitrate",
            "4000",
            "--fps",
            "60",
        ])
        .unwrap();
        assert_eq!(cli.destination.as_deref(), Some("tcp://10.0.0.5:1935/live"));
        assert_eq!(cli.duration, Some(Duration::from_secs(60)));
        assert_eq!(cli.metrics_port, Some(9100));
        assert_eq!(cli.bitrate_kbps, 4000);
        assert_eq!(cli.fps, 60);
    }

    #[test]
    fn zero_fps_and_bad_values_are_rejected() {
        assert!(Cli::try_parse_from(["outflow-node", "--fps", "0"]).is_err());
        assert!(Cli::try_parse_from(["outflow-node", "--duration", "soon"]).is_err());
        assert!(Cli::try_parse_from(["outflow-node", "--metrics-port", "70000"]).is_err());
        assert!(Cli::try_parse_from(["outflow-node", "--unknown"]).is_err());
    }
}
