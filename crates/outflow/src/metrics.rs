//! # Prometheus Metrics
//!
//! Renders output-session statistics in Prometheus text exposition format
//! and provides a lightweight HTTP server for scraping.

use std::fmt::Write;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::session::ConnectionState;
use crate::stats::OutputStats;

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn state_to_u8(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Idle => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::Active => 2,
        ConnectionState::Stopping => 3,
        ConnectionState::Disconnected => 4,
    }
}

/// Render a stats snapshot as Prometheus text exposition format.
pub fn render_prometheus(stats: &OutputStats) -> String {
    let mut out = String::with_capacity(1024);

    let _ = writeln!(
        out,
        "# HELP outflow_state Connection state (0=idle 1=connecting 2=active 3=stopping 4=disconnected)."
    );
    let _ = writeln!(out, "# TYPE outflow_state gauge");
    let _ = writeln!(
        out,
        "outflow_state{{state=\"{}\"}} {}",
        stats.state,
        state_to_u8(stats.state)
    );

    counter(
        &mut out,
        "outflow_bytes_sent_total",
        "Framed bytes handed to the transport.",
        stats.total_bytes_sent,
    );
    counter(
        &mut out,
        "outflow_dropped_frames_total",
        "Video frames dropped under congestion.",
        stats.dropped_frames,
    );
    gauge(
        &mut out,
        "outflow_buffered_packets",
        "Packets waiting in the send buffer.",
        stats.buffered_packets,
    );
    gauge(
        &mut out,
        "outflow_buffered_bytes",
        "Payload bytes waiting in the send buffer.",
        stats.buffered_bytes,
    );
    gauge(
        &mut out,
        "outflow_congestion",
        "Congestion estimate (0.0-1.0).",
        format!("{:.6}", stats.congestion),
    );
    gauge(
        &mut out,
        "outflow_strain",
        "Average buffer strain over the last second.",
        format!("{:.6}", stats.average_strain),
    );
    gauge(
        &mut out,
        "outflow_throughput_bps",
        "Bytes per second handed to the transport.",
        format!("{:.0}", stats.throughput_bps),
    );

    if let Some(kbps) = stats.current_bitrate_kbps {
        gauge(
            &mut out,
            "outflow_bitrate_kbps",
            "Encoder bitrate requested by autotuning.",
            kbps,
        );
    }
    if let Some(kbps) = stats.target_bitrate_kbps {
        gauge(
            &mut out,
            "outflow_target_bitrate_kbps",
            "Ceiling for autotuned bitrate increases.",
            kbps,
        );
    }

    out
}

/// A lightweight HTTP server that serves `/metrics` for Prometheus scraping.
///
/// Runs in a background thread and takes a fresh snapshot from `source` on
/// every request.
pub struct MetricsServer {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn start<F>(bind_addr: SocketAddr, source: F) -> std::io::Result<Self>
    where
        F: Fn() -> OutputStats + Send + 'static,
    {
        let listener = TcpListener::bind(bind_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let handle = thread::Builder::new()
            .name("outflow-metrics".into())
            .spawn(move || serve_loop(listener, source, running_clone))
            .map_err(std::io::Error::other)?;

        Ok(MetricsServer {
            running,
            handle: Some(handle),
            addr,
        })
    }

    /// The address the server is actually listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop<F>(listener: TcpListener, source: F, running: Arc<AtomicBool>)
where
    F: Fn() -> OutputStats,
{
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => handle_connection(stream, &source()),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, stats: &OutputStats) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    let response = if request.starts_with("GET /metrics") {
        let body = render_prometheus(stats);
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };
    let _ = stream.write_all(response.as_bytes());
}
