//! The encoder seam: where header extra-data comes from and where bitrate
//! changes go.

use std::sync::Arc;

use bytes::Bytes;

/// An upstream media encoder.
pub trait Encoder: Send + Sync {
    /// Currently configured bitrate in kbps, 0 if unknown.
    fn bitrate_kbps(&self) -> u32;

    /// Codec configuration bytes sent in the stream header.
    fn extra_data(&self) -> Bytes;

    /// Whether [`Encoder::update_bitrate`] has any effect.
    fn can_update(&self) -> bool {
        true
    }

    /// Apply a new bitrate. The encoder stamps `correlation_id` on the first
    /// video frame it produces at that rate. Must not block.
    fn update_bitrate(&self, kbps: u32, correlation_id: u64);
}

/// The encoders feeding one output: exactly one video, zero or more audio.
#[derive(Clone)]
pub struct EncoderSet {
    pub video: Arc<dyn Encoder>,
    pub audio: Vec<Arc<dyn Encoder>>,
}

impl EncoderSet {
    pub fn new(video: Arc<dyn Encoder>) -> Self {
        EncoderSet {
            video,
            audio: Vec::new(),
        }
    }

    pub fn with_audio(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.audio.push(encoder);
        self
    }

    /// Sum of audio bitrates, used when sizing buffers.
    pub fn audio_bitrate_kbps(&self) -> u32 {
        self.audio.iter().map(|a| a.bitrate_kbps()).sum()
    }
}
