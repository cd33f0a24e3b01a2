//! # Bitrate Controller
//!
//! Closed-loop encoder bitrate adaptation driven by [`StrainEstimator`].
//! Evaluated once per video packet on the caller thread, before the packet
//! reaches the priority gate.
//!
//! ```text
//!              strain > 0.25, held 1.5s
//!   ┌──────────┐ ───────────────────────► decrease: rate *= 1 - strain/4
//!   │ Evaluate │
//!   └──────────┘ ───────────────────────► increase: rate += target * (0.05 - avg)
//!              strain < 0.05 twice, held 5s,
//!              no drops, link keeping up
//! ```
//!
//! Every adjustment is tagged with a correlation id that the encoder stamps on
//! the first frame it produces at the new rate. Until that frame reaches the
//! buffer no further adjustment is made; when it arrives the hold-off timer is
//! pushed forward by the media time still queued ahead of it, so decisions are
//! never made against data that predates the change.

use std::time::Duration;

use quanta::Instant;
use tracing::info;

use crate::estimator::{ideal_buffer_capacity, StrainEstimator};

/// Lowest bitrate the controller will request.
pub const MIN_BITRATE_KBPS: u32 = 100;

/// Hold-off before a decrease may follow the previous adjustment.
pub const DECREASE_HOLDOFF: Duration = Duration::from_millis(1500);

/// Hold-off before an increase may follow the previous adjustment.
pub const INCREASE_HOLDOFF: Duration = Duration::from_secs(5);

/// Strain above which the bitrate is lowered.
pub const DECREASE_STRAIN: f64 = 0.25;

/// Strain below which (twice in a row) the bitrate may be raised.
pub const INCREASE_STRAIN: f64 = 0.05;

/// An increase requires measured throughput of at least this fraction of the
/// rate currently requested (video + audio).
pub const THROUGHPUT_TOLERANCE: f64 = 0.9;

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentReason {
    Congestion,
    Recovery,
}

/// A bitrate change the encoder must apply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateCommand {
    pub bitrate_kbps: u32,
    pub previous_kbps: u32,
    /// Stamp this on the next encoded video frame.
    pub correlation_id: u64,
    pub reason: AdjustmentReason,
    pub strain: f64,
    pub sent_kbps: f64,
}

#[derive(Debug, Clone)]
pub struct BitrateState {
    pub current_kbps: u32,
    pub target_kbps: u32,
    pub audio_kbps: u32,
    pub last_adjustment: Instant,
    pub pending_correlation_id: Option<u64>,
}

// ─── Controller ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BitrateController {
    state: BitrateState,
    last_strain: f64,
    next_correlation_id: u64,
}

impl BitrateController {
    pub fn new(current_kbps: u32, target_kbps: u32, audio_kbps: u32, now: Instant) -> Self {
        BitrateController {
            state: BitrateState {
                current_kbps,
                target_kbps,
                audio_kbps,
                last_adjustment: now,
                pending_correlation_id: None,
            },
            last_strain: 0.0,
            next_correlation_id: 1,
        }
    }

    pub fn state(&self) -> &BitrateState {
        &self.state
    }

    pub fn current_kbps(&self) -> u32 {
        self.state.current_kbps
    }

    pub fn target_kbps(&self) -> u32 {
        self.state.target_kbps
    }

    /// Evaluate one video packet.
    ///
    /// `correlation_id` is the id carried by the packet, `buffered` the media
    /// time queued ahead of it, and `dropped` whether a drop pass removed
    /// frames while admitting it.
    pub fn on_video_packet(
        &mut self,
        correlation_id: Option<u64>,
        buffered: Duration,
        dropped: bool,
        estimator: &StrainEstimator,
        now: Instant,
    ) -> Option<BitrateCommand> {
        if let Some(pending) = self.state.pending_correlation_id {
            if correlation_id == Some(pending) {
                self.resync(buffered, estimator, now);
            }
            return None;
        }

        let strain = estimator.average_strain();
        let sent_kbps = estimator.average_throughput() * 8.0 / 1000.0;
        let since = now.saturating_duration_since(self.state.last_adjustment);
        let current = self.state.current_kbps;

        let command = if since > DECREASE_HOLDOFF
            && strain > DECREASE_STRAIN
            && current > MIN_BITRATE_KBPS
        {
            let lowered = (current as f64 * (1.0 - strain / 4.0)).round() as u32;
            let lowered = lowered.max(MIN_BITRATE_KBPS);
            info!(
                from = current,
                to = lowered,
                strain,
                sent_mbps = sent_kbps / 1000.0,
                "lowering bitrate"
            );
            Some(self.adjust(lowered, AdjustmentReason::Congestion, strain, sent_kbps, now))
        } else if since > INCREASE_HOLDOFF
            && current < self.state.target_kbps
            && strain < INCREASE_STRAIN
            && self.last_strain < INCREASE_STRAIN
            && !dropped
            && self.keeping_up(sent_kbps)
        {
            let avg = (strain + self.last_strain) / 2.0;
            let step = (self.state.target_kbps as f64 * (INCREASE_STRAIN - avg)).round() as u32;
            let raised = current.saturating_add(step).min(self.state.target_kbps);
            info!(
                from = current,
                to = raised,
                strain,
                last = self.last_strain,
                sent_mbps = sent_kbps / 1000.0,
                "increasing bitrate"
            );
            Some(self.adjust(raised, AdjustmentReason::Recovery, strain, sent_kbps, now))
        } else {
            None
        };

        self.last_strain = strain;
        command
    }

    fn keeping_up(&self, sent_kbps: f64) -> bool {
        let requested = (self.state.current_kbps + self.state.audio_kbps) as f64;
        sent_kbps >= requested * THROUGHPUT_TOLERANCE
    }

    fn adjust(
        &mut self,
        bitrate_kbps: u32,
        reason: AdjustmentReason,
        strain: f64,
        sent_kbps: f64,
        now: Instant,
    ) -> BitrateCommand {
        let previous_kbps = self.state.current_kbps;
        let correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;

        self.state.current_kbps = bitrate_kbps;
        self.state.pending_correlation_id = Some(correlation_id);
        self.state.last_adjustment = now;

        BitrateCommand {
            bitrate_kbps,
            previous_kbps,
            correlation_id,
            reason,
            strain,
            sent_kbps,
        }
    }

    fn resync(&mut self, buffered: Duration, estimator: &StrainEstimator, now: Instant) {
        self.state.last_adjustment = now + buffered;
        self.state.pending_correlation_id = None;
        let total = self.state.current_kbps + self.state.audio_kbps;
        estimator.set_target_capacity(ideal_buffer_capacity(total));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strained(strain_pct: usize, t0: Instant) -> StrainEstimator {
        let est = StrainEstimator::default();
        est.record_strain(strain_pct, 100, t0);
        est.record_strain(strain_pct, 100, t0 + Duration::from_millis(100));
        est
    }

    #[test]
    fn sustained_strain_lowers_bitrate() {
        let t0 = Instant::now();
        let mut ctl = BitrateController::new(3000, 3000, 160, t0);
        let est = strained(40, t0);

        let cmd = ctl
            .on_video_packet(None, Duration::ZERO, false, &est, t0 + Duration::from_millis(1600))
            .expect("adjustment");
        assert_eq!(cmd.bitrate_kbps, 2700);
        assert_eq!(cmd.previous_kbps, 3000);
        assert_eq!(cmd.reason, AdjustmentReason::Congestion);
        assert_eq!(cmd.correlation_id, 1);
        assert_eq!(ctl.state().pending_correlation_id, Some(1));
    }

    #[test]
    fn no_decrease_inside_holdoff() {
        let t0 = Instant::now();
        let mut ctl = BitrateController::new(3000, 3000, 160, t0);
        let est = strained(40, t0);
        assert!(ctl
            .on_video_packet(None, Duration::ZERO, false, &est, t0 + Duration::from_millis(1400))
            .is_none());
    }

    #[test]
    fn decrease_is_floored() {
        let t0 = Instant::now();
        let mut ctl = BitrateController::new(110, 3000, 0, t0);
        let est = strained(100, t0);
        let cmd = ctl
            .on_video_packet(None, Duration::ZERO, false, &est, t0 + Duration::from_secs(2))
            .unwrap();
        assert_eq!(cmd.bitrate_kbps, MIN_BITRATE_KBPS);
    }

    #[test]
    fn pending_change_blocks_until_resync() {
        let t0 = Instant::now();
        let mut ctl = BitrateController::new(3000, 3000, 160, t0);
        let est = strained(40, t0);
        let cmd = ctl
            .on_video_packet(None, Duration::ZERO, false, &est, t0 + Duration::from_secs(2))
            .unwrap();

        // Still strained, but the change has not reached the buffer.
        assert!(ctl
            .on_video_packet(None, Duration::ZERO, false, &est, t0 + Duration::from_secs(10))
            .is_none());

        // The tagged frame arrives with 400ms queued ahead of it.
        let arrival = t0 + Duration::from_secs(10);
        assert!(ctl
            .on_video_packet(
                Some(cmd.correlation_id),
                Duration::from_millis(400),
                false,
                &est,
                arrival
            )
            .is_none());
        assert!(ctl.state().pending_correlation_id.is_none());
        assert_eq!(ctl.state().last_adjustment, arrival + Duration::from_millis(400));
        assert_eq!(est.target_capacity(), ideal_buffer_capacity(2860));

        // 1.5s after arrival is still within the pushed-forward hold-off.
        assert!(ctl
            .on_video_packet(None, Duration::ZERO, false, &est, arrival + Duration::from_millis(1600))
            .is_none());
        assert!(ctl
            .on_video_packet(None, Duration::ZERO, false, &est, arrival + Duration::from_millis(2000))
            .is_some());
    }

    #[test]
    fn recovery_raises_towards_target() {
        let t0 = Instant::now();
        let mut ctl = BitrateController::new(2000, 3000, 0, t0);
        let est = StrainEstimator::default();
        // 2 Mbit/s measured: 250_000 bytes per second.
        for i in 0..=10 {
            est.record_send(25_000, t0 + Duration::from_millis(i * 100));
            est.record_strain(0, 100, t0 + Duration::from_millis(i * 100));
        }

        // First evaluation only seeds last_strain (already zero) and is inside hold-off.
        assert!(ctl
            .on_video_packet(None, Duration::ZERO, false, &est, t0 + Duration::from_secs(1))
            .is_none());

        let cmd = ctl
            .on_video_packet(None, Duration::ZERO, false, &est, t0 + Duration::from_secs(6))
            .unwrap();
        assert_eq!(cmd.reason, AdjustmentReason::Recovery);
        // 2000 + 3000 * 0.05
        assert_eq!(cmd.bitrate_kbps, 2150);
    }

    #[test]
    fn no_recovery_after_drops_or_when_link_trails() {
        let t0 = Instant::now();
        let est = StrainEstimator::default();
        est.record_strain(0, 100, t0);

        let mut ctl = BitrateController::new(2000, 3000, 0, t0);
        assert!(ctl
            .on_video_packet(None, Duration::ZERO, true, &est, t0 + Duration::from_secs(6))
            .is_none());

        // No throughput samples at all: the link is not keeping up.
        assert!(ctl
            .on_video_packet(None, Duration::ZERO, false, &est, t0 + Duration::from_secs(7))
            .is_none());
    }

    #[test]
    fn recovery_is_capped_at_target() {
        let t0 = Instant::now();
        let mut ctl = BitrateController::new(2990, 3000, 0, t0);
        let est = StrainEstimator::default();
        for i in 0..=10 {
            est.record_send(40_000, t0 + Duration::from_millis(i * 100));
        }
        let cmd = ctl
            .on_video_packet(None, Duration::ZERO, false, &est, t0 + Duration::from_secs(6))
            .unwrap();
        assert_eq!(cmd.bitrate_kbps, 3000);
    }
}
