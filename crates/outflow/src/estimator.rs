//! # Strain Estimator
//!
//! Two rolling one-second windows of telemetry:
//!
//! - **strain**: pending bytes over buffer capacity, a congestion proxy
//! - **throughput**: bytes handed to the transport per send
//!
//! Samples are pruned from the front while the window spans more than its
//! horizon, but the two newest samples always survive so an idle link still
//! reports its last observation.
//!
//! Recorded from the send worker (or socket writer) and read from the
//! caller thread by the bitrate controller, so the windows sit behind a mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use quanta::Instant;

/// Horizon of both rolling windows.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Floor for the ideal socket buffer capacity, in bytes.
pub const MIN_BUFFER_CAPACITY: usize = 131_072;

/// Ideal buffer capacity for a total bitrate: one second of data
/// (`kbps * 1000 / 8`, approximated as `kbps * 128`), floored.
pub fn ideal_buffer_capacity(total_kbps: u32) -> usize {
    (total_kbps as usize * 128).max(MIN_BUFFER_CAPACITY)
}

// ─── Window ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Window<T> {
    samples: VecDeque<(Instant, T)>,
}

impl<T: Copy> Window<T> {
    fn push(&mut self, at: Instant, value: T) {
        self.samples.push_back((at, value));
        self.prune();
    }

    fn prune(&mut self) {
        while self.samples.len() > 2 {
            let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back())
            else {
                break;
            };
            if last.saturating_duration_since(first) <= WINDOW {
                break;
            }
            self.samples.pop_front();
        }
    }

    fn span(&self) -> Duration {
        match (self.samples.front(), self.samples.back()) {
            (Some(&(first, _)), Some(&(last, _))) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug, Default)]
struct Windows {
    strain: Window<f64>,
    sent: Window<u64>,
}

// ─── Estimator ──────────────────────────────────────────────────────────────

/// Rolling-window strain and throughput telemetry.
#[derive(Debug)]
pub struct StrainEstimator {
    windows: Mutex<Windows>,
    target_capacity: AtomicUsize,
}

impl Default for StrainEstimator {
    fn default() -> Self {
        StrainEstimator::new(MIN_BUFFER_CAPACITY)
    }
}

impl StrainEstimator {
    pub fn new(target_capacity: usize) -> Self {
        StrainEstimator {
            windows: Mutex::new(Windows::default()),
            target_capacity: AtomicUsize::new(target_capacity),
        }
    }

    /// Record `bytes` handed to the transport at `at`.
    pub fn record_send(&self, bytes: usize, at: Instant) {
        let mut w = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        w.sent.push(at, bytes as u64);
    }

    /// Record `pending / capacity` as a strain sample. A zero capacity is ignored.
    pub fn record_strain(&self, pending: usize, capacity: usize, at: Instant) {
        if capacity == 0 {
            return;
        }
        let strain = pending as f64 / capacity as f64;
        let mut w = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        w.strain.push(at, strain);
    }

    /// Mean strain over the window, 0 when empty.
    pub fn average_strain(&self) -> f64 {
        let w = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let n = w.strain.samples.len();
        if n == 0 {
            return 0.0;
        }
        w.strain.samples.iter().map(|&(_, s)| s).sum::<f64>() / n as f64
    }

    /// Bytes per second over the window, 0 with fewer than two samples or no
    /// elapsed time between them.
    pub fn average_throughput(&self) -> f64 {
        let w = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let span = w.sent.span().as_secs_f64();
        if w.sent.samples.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        let total: u64 = w.sent.samples.iter().map(|&(_, b)| b).sum();
        total as f64 / span
    }

    /// Ideal socket buffer capacity last computed by the bitrate controller.
    pub fn target_capacity(&self) -> usize {
        self.target_capacity.load(Ordering::Relaxed)
    }

    pub fn set_target_capacity(&self, capacity: usize) {
        self.target_capacity.store(capacity, Ordering::Relaxed);
    }

    /// Forget every sample. Used when a new session starts.
    pub fn reset(&self) {
        let mut w = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        w.strain.clear();
        w.sent.clear();
    }
}
