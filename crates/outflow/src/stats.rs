//! # Output Statistics
//!
//! Point-in-time snapshot of an output session, designed for Prometheus
//! export and JSON serialization.

use serde::Serialize;

use crate::session::ConnectionState;

#[derive(Debug, Clone, Serialize)]
pub struct OutputStats {
    pub state: ConnectionState,
    /// Framed bytes handed to the transport since the session started.
    pub total_bytes_sent: u64,
    /// Frames removed by drop passes or rejected at the priority gate.
    pub dropped_frames: u64,
    pub buffered_packets: usize,
    /// Payload bytes waiting in the packet buffer.
    pub buffered_bytes: usize,
    /// 0.0 (idle link) to 1.0 (saturated or actively dropping).
    pub congestion: f64,
    /// Present only while bitrate autotuning is active.
    pub current_bitrate_kbps: Option<u32>,
    pub target_bitrate_kbps: Option<u32>,
    pub average_strain: f64,
    /// Bytes per second over the last second.
    pub throughput_bps: f64,
}

impl Default for OutputStats {
    fn default() -> Self {
        OutputStats {
            state: ConnectionState::Idle,
            total_bytes_sent: 0,
            dropped_frames: 0,
            buffered_packets: 0,
            buffered_bytes: 0,
            congestion: 0.0,
            current_bitrate_kbps: None,
            target_bitrate_kbps: None,
            average_strain: 0.0,
            throughput_bps: 0.0,
        }
    }
}

impl OutputStats {
    /// Throughput in kbit/s.
    pub fn throughput_kbps(&self) -> f64 {
        self.throughput_bps * 8.0 / 1000.0
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_uses_lowercase_state() {
        let stats = OutputStats {
            state: ConnectionState::Active,
            total_bytes_sent: 4096,
            dropped_frames: 3,
            current_bitrate_kbps: Some(2700),
            ..OutputStats::default()
        };
        let v: serde_json::Value = serde_json::from_str(&stats.to_json()).unwrap();
        assert_eq!(v["state"], "active");
        assert_eq!(v["total_bytes_sent"], 4096);
        assert_eq!(v["dropped_frames"], 3);
        assert_eq!(v["current_bitrate_kbps"], 2700);
        assert!(v["target_bitrate_kbps"].is_null());
    }

    #[test]
    fn throughput_conversion() {
        let stats = OutputStats {
            throughput_bps: 250_000.0,
            ..OutputStats::default()
        };
        assert!((stats.throughput_kbps() - 2000.0).abs() < 1e-9);
    }
}
