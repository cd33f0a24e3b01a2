//! # Serializer
//!
//! The wire-format seam. The state machine asks the serializer for stream
//! metadata and per-track header packets once after connecting, then for a
//! framed header before every packet payload.
//!
//! [`FramedSerializer`] is a minimal length-prefixed framing:
//!
//! ```text
//!   metadata : 'M' | len u32 | bytes
//!   header   : 'H' | PacketHeader (24 bytes)
//!   packet   : 'P' | PacketHeader (24 bytes)
//! ```
//!
//! The payload follows each header verbatim.

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoder::Encoder;
use crate::error::SerializeError;
use crate::packet::{DropPriority, MediaKind, OutboundPacket, PacketHeader, PACKET_HEADER_LEN};

pub const TAG_METADATA: u8 = b'M';
pub const TAG_HEADER: u8 = b'H';
pub const TAG_PACKET: u8 = b'P';

pub trait Serializer: Send + Sync {
    /// Build the stream header packet for one encoder.
    fn header_packet(&self, kind: MediaKind, track_index: usize, encoder: &dyn Encoder) -> OutboundPacket {
        let extra = encoder.extra_data();
        match kind {
            MediaKind::Audio => OutboundPacket::audio(track_index, extra, 0, 0),
            MediaKind::Video => OutboundPacket::video(extra, 0, 0, DropPriority::Highest)
                .with_keyframe()
                .with_track(track_index),
        }
    }

    /// Frame the header that precedes a payload on the wire.
    fn frame_message(&self, header: &PacketHeader, is_header: bool) -> Result<Bytes, SerializeError>;

    /// Stream metadata for `track_index`, or `None` once every track is covered.
    fn metadata(&self, _track_index: usize) -> Option<Bytes> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct FramedSerializer {
    metadata: Vec<Bytes>,
}

impl FramedSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata blobs, one per track, sent in order after connecting.
    pub fn with_metadata(metadata: Vec<Bytes>) -> Self {
        FramedSerializer { metadata }
    }
}

impl Serializer for FramedSerializer {
    fn frame_message(&self, header: &PacketHeader, is_header: bool) -> Result<Bytes, SerializeError> {
        let mut buf = BytesMut::with_capacity(1 + PACKET_HEADER_LEN);
        buf.put_u8(if is_header { TAG_HEADER } else { TAG_PACKET });
        header.encode(&mut buf);
        Ok(buf.freeze())
    }

    fn metadata(&self, track_index: usize) -> Option<Bytes> {
        let blob = self.metadata.get(track_index)?;
        let len = u32::try_from(blob.len()).ok()?;
        let mut buf = BytesMut::with_capacity(5 + blob.len());
        buf.put_u8(TAG_METADATA);
        buf.put_u32(len);
        buf.extend_from_slice(blob);
        Some(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    struct FixedEncoder;

    impl Encoder for FixedEncoder {
        fn bitrate_kbps(&self) -> u32 {
            2500
        }

        fn extra_data(&self) -> Bytes {
            Bytes::from_static(b"\x01sps-pps")
        }

        fn update_bitrate(&self, _kbps: u32, _correlation_id: u64) {}
    }

    #[test]
    fn video_header_packet_is_a_keyframe() {
        let ser = FramedSerializer::new();
        let pkt = ser.header_packet(MediaKind::Video, 0, &FixedEncoder);
        assert!(pkt.keyframe);
        assert_eq!(pkt.payload, Bytes::from_static(b"\x01sps-pps"));

        let pkt = ser.header_packet(MediaKind::Audio, 1, &FixedEncoder);
        assert!(pkt.is_audio());
        assert_eq!(pkt.track_index, 1);
    }

    #[test]
    fn frame_tags_distinguish_headers() {
        let ser = FramedSerializer::new();
        let pkt = OutboundPacket::audio(0, Bytes::from_static(b"aac"), 10, 10);
        let mut framed = ser.frame_message(&pkt.header().unwrap(), true).unwrap();
        assert_eq!(framed.len(), 1 + PACKET_HEADER_LEN);
        assert_eq!(framed.get_u8(), TAG_HEADER);
        assert_eq!(PacketHeader::decode(&mut framed), Some(pkt.header().unwrap()));

        let framed = ser.frame_message(&pkt.header().unwrap(), false).unwrap();
        assert_eq!(framed[0], TAG_PACKET);
    }

    #[test]
    fn metadata_runs_out_after_last_track() {
        let ser = FramedSerializer::with_metadata(vec![Bytes::from_static(b"{\"w\":1920}")]);
        let first = ser.metadata(0).unwrap();
        assert_eq!(first[0], TAG_METADATA);
        assert_eq!(&first[1..5], &10u32.to_be_bytes());
        assert!(ser.metadata(1).is_none());
    }
}
