//! # Drop Controller
//!
//! Bounded-delay admission control for video. Every incoming video packet
//! first triggers a check of how much media time is sitting in the buffer:
//!
//! ```text
//!   buffered > pframe_threshold ──► P-frame pass (keep >= Highest)
//!   buffered > drop_threshold   ──► low-priority pass (keep >= High)
//!   otherwise                   ──► nothing
//! ```
//!
//! A pass raises `min_priority` to its cutoff. Until a video packet at or
//! above that priority shows up, every lower-priority arrival is rejected
//! without being buffered. The first packet that clears the gate ends the
//! congestion episode and resets it to zero.
//!
//! Audio never passes through here and is never removed by a pass.

use std::time::Duration;

use tracing::debug;

use crate::buffer::PacketBuffer;
use crate::packet::{DropPriority, OutboundPacket};

/// A drop check is skipped while fewer packets than this are buffered.
pub const MIN_BUFFERED_PACKETS: usize = 5;

/// Minimum gap enforced between the two thresholds.
pub const MIN_THRESHOLD_GAP: Duration = Duration::from_millis(200);

pub const DEFAULT_DROP_THRESHOLD: Duration = Duration::from_millis(500);
pub const DEFAULT_PFRAME_DROP_THRESHOLD: Duration = Duration::from_millis(800);

// ─── Thresholds ─────────────────────────────────────────────────────────────

/// The pair of buffered-duration triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropThresholds {
    drop: Duration,
    pframe: Duration,
}

impl DropThresholds {
    /// Build thresholds, raising `pframe` to `drop + 200ms` if it is too close.
    pub fn new(drop: Duration, pframe: Duration) -> Self {
        let floor = drop + MIN_THRESHOLD_GAP;
        DropThresholds {
            drop,
            pframe: pframe.max(floor),
        }
    }

    pub fn drop(&self) -> Duration {
        self.drop
    }

    pub fn pframe(&self) -> Duration {
        self.pframe
    }
}

impl Default for DropThresholds {
    fn default() -> Self {
        DropThresholds::new(DEFAULT_DROP_THRESHOLD, DEFAULT_PFRAME_DROP_THRESHOLD)
    }
}

// ─── Pass / Outcome ─────────────────────────────────────────────────────────

/// Which drop pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPass {
    /// Removes everything below `High`.
    LowPriority,
    /// Removes everything below `Highest`.
    PFrame,
}

impl DropPass {
    pub fn cutoff(&self) -> DropPriority {
        match self {
            DropPass::LowPriority => DropPriority::High,
            DropPass::PFrame => DropPriority::Highest,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DropPass::LowPriority => "b-frames",
            DropPass::PFrame => "p-frames",
        }
    }
}

/// Result of a drop check that actually ran a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropOutcome {
    pub pass: DropPass,
    pub dropped: usize,
}

/// What happened to a video packet at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    Rejected,
}

// ─── Controller ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DropController {
    thresholds: DropThresholds,
    min_priority: DropPriority,
    dropped_frames: u64,
}

impl DropController {
    pub fn new(thresholds: DropThresholds) -> Self {
        DropController {
            thresholds,
            min_priority: DropPriority::Disposable,
            dropped_frames: 0,
        }
    }

    pub fn thresholds(&self) -> DropThresholds {
        self.thresholds
    }

    /// Current gate. `Disposable` means no congestion episode is active.
    pub fn min_priority(&self) -> DropPriority {
        self.min_priority
    }

    pub fn gate_active(&self) -> bool {
        self.min_priority > DropPriority::Disposable
    }

    /// Frames removed by passes plus frames rejected at the gate.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Forget the congestion episode. The dropped-frame count survives.
    pub fn reset(&mut self) {
        self.min_priority = DropPriority::Disposable;
    }

    /// Measure the buffer and run at most one drop pass.
    pub fn check(&mut self, buffer: &mut PacketBuffer) -> Option<DropOutcome> {
        if buffer.len() < MIN_BUFFERED_PACKETS {
            return None;
        }
        let buffered = buffer.buffered_duration()?;

        let pass = if buffered > self.thresholds.pframe {
            DropPass::PFrame
        } else if buffered > self.thresholds.drop {
            DropPass::LowPriority
        } else {
            return None;
        };

        debug!(buffered_ms = buffered.as_millis() as u64, "buffer over threshold");
        let before = buffer.len();
        let dropped = buffer.retain_priority(pass.cutoff());

        if self.min_priority < pass.cutoff() {
            self.min_priority = pass.cutoff();
        }
        if dropped > 0 {
            self.dropped_frames += dropped as u64;
            debug!(
                pass = pass.name(),
                before,
                after = buffer.len(),
                "dropped frames"
            );
        }
        Some(DropOutcome { pass, dropped })
    }

    /// Apply the priority gate and, if the packet clears it, buffer it.
    ///
    /// A rejected packet is released here and counted as dropped.
    pub fn admit(&mut self, buffer: &mut PacketBuffer, packet: OutboundPacket) -> Admission {
        if packet.drop_priority < self.min_priority {
            self.dropped_frames += 1;
            return Admission::Rejected;
        }
        self.min_priority = DropPriority::Disposable;
        buffer.push_back(packet);
        Admission::Queued
    }

    /// The single entry point for video: drop check, then gate.
    pub fn try_admit_video(
        &mut self,
        buffer: &mut PacketBuffer,
        packet: OutboundPacket,
    ) -> (Option<DropOutcome>, Admission) {
        let outcome = self.check(buffer);
        (outcome, self.admit(buffer, packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(dts_ms: i64, priority: DropPriority) -> OutboundPacket {
        let pkt = OutboundPacket::video(Bytes::from_static(b"frame"), dts_ms * 1000, dts_ms * 1000, priority);
        if priority == DropPriority::Highest {
            pkt.with_keyframe()
        } else {
            pkt
        }
    }

    fn controller(drop_ms: u64, pframe_ms: u64) -> DropController {
        DropController::new(DropThresholds::new(
            Duration::from_millis(drop_ms),
            Duration::from_millis(pframe_ms),
        ))
    }

    #[test]
    fn pframe_threshold_is_kept_above_drop_threshold() {
        let t = DropThresholds::new(Duration::from_millis(500), Duration::from_millis(600));
        assert_eq!(t.pframe(), Duration::from_millis(700));

        let t = DropThresholds::new(Duration::from_millis(500), Duration::from_millis(900));
        assert_eq!(t.pframe(), Duration::from_millis(900));

        let t = DropThresholds::default();
        assert_eq!(t.drop(), Duration::from_millis(500));
        assert_eq!(t.pframe(), Duration::from_millis(800));
    }

    #[test]
    fn low_priority_pass_drops_low_frames() {
        let mut buf = PacketBuffer::new();
        let mut ctl = controller(500, 1200);
        for (dts, prio) in [
            (0, DropPriority::Highest),
            (225, DropPriority::Low),
            (450, DropPriority::Low),
            (675, DropPriority::Low),
            (900, DropPriority::Highest),
        ] {
            assert_eq!(ctl.admit(&mut buf, video(dts, prio)), Admission::Queued);
        }

        let (outcome, admission) = ctl.try_admit_video(&mut buf, video(950, DropPriority::Highest));
        assert_eq!(
            outcome,
            Some(DropOutcome {
                pass: DropPass::LowPriority,
                dropped: 3
            })
        );
        assert_eq!(admission, Admission::Queued);
        assert_eq!(buf.len(), 3);
        assert_eq!(ctl.dropped_frames(), 3);
        // The Highest arrival cleared the gate.
        assert_eq!(ctl.min_priority(), DropPriority::Disposable);
    }

    #[test]
    fn pframe_pass_keeps_only_keyframes() {
        let mut buf = PacketBuffer::new();
        let mut ctl = controller(500, 800);
        ctl.admit(&mut buf, video(0, DropPriority::Highest));
        ctl.admit(&mut buf, video(100, DropPriority::High));
        ctl.admit(&mut buf, video(200, DropPriority::Low));
        ctl.admit(&mut buf, video(600, DropPriority::High));
        ctl.admit(&mut buf, video(1000, DropPriority::High));

        let (outcome, admission) = ctl.try_admit_video(&mut buf, video(1033, DropPriority::High));
        assert_eq!(outcome.map(|o| o.pass), Some(DropPass::PFrame));
        assert_eq!(admission, Admission::Rejected);
        assert_eq!(buf.len(), 1);
        assert_eq!(ctl.min_priority(), DropPriority::Highest);
        assert_eq!(ctl.dropped_frames(), 5);
    }

    #[test]
    fn gate_rejects_until_priority_recovers() {
        let mut buf = PacketBuffer::new();
        let mut ctl = controller(500, 1200);
        ctl.admit(&mut buf, video(0, DropPriority::Highest));
        for dts in [100, 200, 300, 700] {
            ctl.admit(&mut buf, video(dts, DropPriority::Low));
        }
        let (outcome, admission) = ctl.try_admit_video(&mut buf, video(733, DropPriority::Low));
        assert!(outcome.is_some());
        assert_eq!(admission, Admission::Rejected);
        assert_eq!(ctl.min_priority(), DropPriority::High);

        assert_eq!(ctl.admit(&mut buf, video(766, DropPriority::Disposable)), Admission::Rejected);
        assert_eq!(ctl.admit(&mut buf, video(800, DropPriority::High)), Admission::Queued);
        assert_eq!(ctl.min_priority(), DropPriority::Disposable);
        assert_eq!(ctl.admit(&mut buf, video(833, DropPriority::Low)), Admission::Queued);
    }

    #[test]
    fn small_buffers_are_never_checked() {
        let mut buf = PacketBuffer::new();
        let mut ctl = controller(500, 800);
        ctl.admit(&mut buf, video(0, DropPriority::Low));
        ctl.admit(&mut buf, video(2000, DropPriority::Low));
        assert!(ctl.check(&mut buf).is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn keyframe_only_buffer_is_never_checked() {
        let mut buf = PacketBuffer::new();
        let mut ctl = controller(500, 800);
        for dts in [0, 500, 1000, 1500, 2000] {
            ctl.admit(&mut buf, video(dts, DropPriority::Highest));
        }
        assert!(ctl.check(&mut buf).is_none());
        assert!(!ctl.gate_active());
    }
}
