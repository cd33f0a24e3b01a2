//! # Packet Buffer
//!
//! FIFO of packets waiting for the send worker. Appends go to the tail,
//! the send worker pops from the front, and a drop pass may remove interior
//! video packets while keeping the relative order of everything that survives.
//!
//! The buffer tracks the dts of the last video packet it admitted so the drop
//! policy can measure how much media time is waiting to go out.

use std::collections::VecDeque;
use std::time::Duration;

use crate::packet::{DropPriority, OutboundPacket};

/// Ordered store of pending outbound packets.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    packets: VecDeque<OutboundPacket>,
    payload_bytes: usize,
    last_video_dts_usec: Option<i64>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet. Never fails.
    pub fn push_back(&mut self, packet: OutboundPacket) {
        if packet.is_video() {
            self.last_video_dts_usec = Some(packet.dts_usec);
        }
        self.payload_bytes += packet.size();
        self.packets.push_back(packet);
    }

    /// Remove the oldest packet, handing ownership to the caller.
    pub fn pop_front(&mut self) -> Option<OutboundPacket> {
        let packet = self.packets.pop_front()?;
        self.payload_bytes -= packet.size();
        Some(packet)
    }

    pub fn front(&self) -> Option<&OutboundPacket> {
        self.packets.front()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Sum of payload sizes currently buffered.
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// dts of the most recently admitted video packet, if any.
    pub fn last_video_dts_usec(&self) -> Option<i64> {
        self.last_video_dts_usec
    }

    /// The oldest buffered video packet that is not a keyframe.
    pub fn first_droppable_video(&self) -> Option<&OutboundPacket> {
        self.packets.iter().find(|p| p.is_video() && !p.keyframe)
    }

    /// Media time waiting to go out: last admitted video dts minus the dts of
    /// the oldest droppable video packet. `None` when nothing is droppable.
    pub fn buffered_duration(&self) -> Option<Duration> {
        let first = self.first_droppable_video()?;
        let last = self.last_video_dts_usec?;
        Some(usec_span(first.dts_usec, last))
    }

    /// Span between the front packet and `dts_usec`. Zero when empty.
    pub fn span_to(&self, dts_usec: i64) -> Duration {
        match self.packets.front() {
            Some(front) => usec_span(front.dts_usec, dts_usec),
            None => Duration::ZERO,
        }
    }

    /// Keep audio and every video packet at or above `cutoff`; drop the rest.
    /// Returns the number of packets released.
    pub fn retain_priority(&mut self, cutoff: DropPriority) -> usize {
        let before = self.packets.len();
        let mut freed_bytes = 0;
        self.packets.retain(|p| {
            let keep = p.is_audio() || p.drop_priority >= cutoff;
            if !keep {
                freed_bytes += p.size();
            }
            keep
        });
        self.payload_bytes -= freed_bytes;
        before - self.packets.len()
    }

    /// Release every buffered packet. Returns how many were freed.
    pub fn clear(&mut self) -> usize {
        let freed = self.packets.len();
        self.packets.clear();
        self.payload_bytes = 0;
        self.last_video_dts_usec = None;
        freed
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundPacket> {
        self.packets.iter()
    }
}

fn usec_span(from: i64, to: i64) -> Duration {
    Duration::from_micros(to.saturating_sub(from).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(dts_ms: i64, priority: DropPriority) -> OutboundPacket {
        OutboundPacket::video(Bytes::from(vec![0u8; 100]), dts_ms * 1000, dts_ms * 1000, priority)
    }

    fn audio(dts_ms: i64) -> OutboundPacket {
        OutboundPacket::audio(0, Bytes::from(vec![0u8; 10]), dts_ms * 1000, dts_ms * 1000)
    }

    #[test]
    fn fifo_order_and_byte_accounting() {
        let mut buf = PacketBuffer::new();
        buf.push_back(video(0, DropPriority::High));
        buf.push_back(audio(10));
        buf.push_back(video(33, DropPriority::Low));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.payload_bytes(), 210);

        assert_eq!(buf.pop_front().unwrap().dts_usec, 0);
        assert!(buf.pop_front().unwrap().is_audio());
        assert_eq!(buf.payload_bytes(), 100);
        assert_eq!(buf.last_video_dts_usec(), Some(33_000));
    }

    #[test]
    fn duration_skips_keyframes_when_choosing_reference() {
        let mut buf = PacketBuffer::new();
        buf.push_back(video(0, DropPriority::Highest).with_keyframe());
        buf.push_back(video(100, DropPriority::Low));
        buf.push_back(video(700, DropPriority::Low));
        assert_eq!(buf.buffered_duration(), Some(Duration::from_millis(600)));
    }

    #[test]
    fn no_droppable_reference_means_no_duration() {
        let mut buf = PacketBuffer::new();
        buf.push_back(audio(0));
        buf.push_back(video(0, DropPriority::Highest).with_keyframe());
        buf.push_back(video(900, DropPriority::Highest).with_keyframe());
        assert!(buf.buffered_duration().is_none());
    }

    #[test]
    fn retain_keeps_audio_and_order() {
        let mut buf = PacketBuffer::new();
        buf.push_back(video(0, DropPriority::Highest).with_keyframe());
        buf.push_back(audio(5));
        buf.push_back(video(33, DropPriority::Disposable));
        buf.push_back(video(66, DropPriority::High));
        buf.push_back(audio(70));

        let dropped = buf.retain_priority(DropPriority::High);
        assert_eq!(dropped, 1);
        let dts: Vec<i64> = buf.iter().map(|p| p.dts_usec / 1000).collect();
        assert_eq!(dts, vec![0, 5, 66, 70]);
        assert_eq!(buf.payload_bytes(), 220);
    }

    #[test]
    fn span_to_measures_from_front() {
        let mut buf = PacketBuffer::new();
        assert_eq!(buf.span_to(1_000_000), Duration::ZERO);
        buf.push_back(video(200, DropPriority::Low));
        assert_eq!(buf.span_to(450_000), Duration::from_millis(250));
        assert_eq!(buf.span_to(100_000), Duration::ZERO);
    }

    #[test]
    fn clear_reports_freed_count() {
        let mut buf = PacketBuffer::new();
        for i in 0..4 {
            buf.push_back(video(i * 33, DropPriority::Low));
        }
        assert_eq!(buf.clear(), 4);
        assert!(buf.is_empty());
        assert_eq!(buf.payload_bytes(), 0);
    }
}
