//! # Outbound Packets
//!
//! Encoded media units on their way from the encoder to the wire, and the
//! fixed-size header that describes each one to the serializer.
//!
//! A packet has exactly one owner at a time: the [`crate::buffer::PacketBuffer`]
//! while queued, the send worker while in flight. `OutboundPacket` is
//! intentionally not `Clone`, so a packet is released exactly once, either
//! after its write or when it is dropped.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::SerializeError;

// ─── Media Kind ─────────────────────────────────────────────────────────────

/// Which elementary stream a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaKind {
    Audio = 0,
    Video = 1,
}

impl MediaKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MediaKind::Audio),
            1 => Some(MediaKind::Video),
            _ => None,
        }
    }
}

// ─── Drop Priority ──────────────────────────────────────────────────────────

/// Importance of a video frame under congestion. Higher survives longer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DropPriority {
    /// Non-reference frames, first to go.
    #[default]
    Disposable = 0,
    /// B-frames.
    Low = 1,
    /// P-frames / reference frames.
    High = 2,
    /// Keyframes and parameter sets.
    Highest = 3,
}

impl DropPriority {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(DropPriority::Disposable),
            1 => Some(DropPriority::Low),
            2 => Some(DropPriority::High),
            3 => Some(DropPriority::Highest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DropPriority::Disposable => "disposable",
            DropPriority::Low => "low",
            DropPriority::High => "high",
            DropPriority::Highest => "highest",
        }
    }
}

// ─── Outbound Packet ────────────────────────────────────────────────────────

/// One encoded audio or video unit awaiting transmission.
#[derive(Debug)]
pub struct OutboundPacket {
    pub kind: MediaKind,
    pub payload: Bytes,
    pub pts_usec: i64,
    pub dts_usec: i64,
    pub track_index: usize,
    pub keyframe: bool,
    pub drop_priority: DropPriority,
    /// Set on the first frame produced after a bitrate change, so the
    /// controller can tell when the change has reached the buffer.
    pub correlation_id: Option<u64>,
}

impl OutboundPacket {
    /// An audio packet. Audio is never dropped, so its priority is nominal.
    pub fn audio(track_index: usize, payload: Bytes, pts_usec: i64, dts_usec: i64) -> Self {
        OutboundPacket {
            kind: MediaKind::Audio,
            payload,
            pts_usec,
            dts_usec,
            track_index,
            keyframe: false,
            drop_priority: DropPriority::Highest,
            correlation_id: None,
        }
    }

    /// A non-keyframe video packet on track 0.
    pub fn video(payload: Bytes, pts_usec: i64, dts_usec: i64, priority: DropPriority) -> Self {
        OutboundPacket {
            kind: MediaKind::Video,
            payload,
            pts_usec,
            dts_usec,
            track_index: 0,
            keyframe: false,
            drop_priority: priority,
            correlation_id: None,
        }
    }

    /// Mark as a keyframe. Keyframes always carry the highest priority.
    pub fn with_keyframe(mut self) -> Self {
        self.keyframe = true;
        self.drop_priority = DropPriority::Highest;
        self
    }

    pub fn with_track(mut self, track_index: usize) -> Self {
        self.track_index = track_index;
        self
    }

    pub fn with_correlation_id(mut self, id: u64) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The framing header handed to the serializer ahead of the payload.
    ///
    /// Fails when the track index or payload size does not fit the header.
    pub fn header(&self) -> Result<PacketHeader, SerializeError> {
        let track_index = u16::try_from(self.track_index)
            .map_err(|_| SerializeError(format!("track index {} out of range", self.track_index)))?;
        let size = u32::try_from(self.payload.len())
            .map_err(|_| SerializeError(format!("payload of {} bytes too large", self.payload.len())))?;
        Ok(PacketHeader {
            kind: self.kind,
            keyframe: self.keyframe,
            track_index,
            size,
            pts_usec: self.pts_usec,
            dts_usec: self.dts_usec,
        })
    }
}

// ─── Packet Header ──────────────────────────────────────────────────────────

/// Encoded length of a [`PacketHeader`].
pub const PACKET_HEADER_LEN: usize = 24;

/// Fixed-size description of a packet: `(pts, dts, size, track, type, keyframe)`.
///
/// Layout (big endian):
///
/// ```text
/// | kind u8 | flags u8 | track u16 | size u32 | pts i64 | dts i64 |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: MediaKind,
    pub keyframe: bool,
    pub track_index: u16,
    pub size: u32,
    pub pts_usec: i64,
    pub dts_usec: i64,
}

impl PacketHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.keyframe as u8);
        buf.put_u16(self.track_index);
        buf.put_u32(self.size);
        buf.put_i64(self.pts_usec);
        buf.put_i64(self.dts_usec);
    }

    /// Decode a header. Returns `None` if the buffer is short or the kind is unknown.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < PACKET_HEADER_LEN {
            return None;
        }
        let kind = MediaKind::from_byte(buf.get_u8())?;
        let keyframe = buf.get_u8() & 1 == 1;
        let track_index = buf.get_u16();
        let size = buf.get_u32();
        let pts_usec = buf.get_i64();
        let dts_usec = buf.get_i64();
        Some(PacketHeader {
            kind,
            keyframe,
            track_index,
            size,
            pts_usec,
            dts_usec,
        })
    }
}
