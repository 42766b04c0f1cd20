//! Codec seam between the input ring buffer and the output path.
//!
//! A [`Codec`] pulls encoded bytes from the input ring and pushes decoded
//! interleaved stereo `i32` frames (or raw bytes, for pass-through) into a
//! [`CodecSink`]. The decode stage owns the sink and routes frames through
//! the sample-rate transform into the output ring; tests substitute a
//! vector-backed sink.

mod pcm;
mod symphonia;
mod thru;

pub use pcm::PcmCodec;
pub use symphonia::SymphoniaCodec;
pub use thru::ThruCodec;

use crate::buffer::RingBuffer;
use crate::error::Result;
use render_bridge_types::{CodecId, EncodeMode, SampleFormat};

/// Everything a codec needs to know before the first byte arrives.
#[derive(Clone, Debug)]
pub struct CodecParams {
    pub id: CodecId,
    /// Source format hint. Authoritative for PCM; a probe hint otherwise.
    pub format: SampleFormat,
    /// Total encoded bytes when the source announced a length.
    pub total_bytes: Option<u64>,
}

/// Where decoded audio goes.
pub trait CodecSink: Send {
    /// Announce the decoded sample rate once known. May be called again on
    /// a mid-stream rate change; the sink re-arms its transform.
    fn set_rate(&mut self, rate: u32);

    /// Push interleaved stereo frames (2 samples per frame). Returns the
    /// number of frames accepted; the codec retries the remainder later.
    fn write_frames(&mut self, frames: &[i32]) -> usize;

    /// Pass-through path: push source bytes untouched.
    fn write_bytes(&mut self, bytes: &[u8]) -> usize;

    /// Frames the sink can accept right now without truncating.
    fn space_frames(&self) -> usize;
}

/// One decode step's verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// More to do; call again when gates are satisfied.
    Running,
    /// Every source byte has been decoded and handed to the sink.
    Complete,
    /// Unrecoverable stream corruption; the track is abandoned.
    Error,
}

/// Per-step view handed to [`Codec::decode`].
pub struct DecodeContext<'a> {
    pub streambuf: &'a RingBuffer,
    pub sink: &'a mut dyn CodecSink,
    /// True once the stream stage saw end of source; the codec must drain
    /// whatever partial data remains rather than wait for more.
    pub stream_ended: bool,
}

pub trait Codec: Send {
    fn id(&self) -> CodecId;

    /// Input gate: skip the step unless this many bytes are buffered
    /// (waived once the stream has ended).
    fn min_read_bytes(&self) -> usize;

    /// Output gate: skip the step unless the sink has room for this many
    /// frames.
    fn min_space(&self) -> usize;

    fn open(&mut self, params: &CodecParams) -> Result<()>;

    fn decode(&mut self, cx: &mut DecodeContext<'_>) -> DecodeOutcome;

    /// Release per-track resources. Must be callable mid-stream (flush).
    fn close(&mut self);
}

/// Pick the codec implementation for a track.
///
/// Pass-through mode short-circuits decoding entirely; PCM sources use the
/// fixed-format unpacker; everything else goes through the probe-based
/// decoder.
pub fn new_codec(id: CodecId, mode: EncodeMode) -> Result<Box<dyn Codec>> {
    if mode == EncodeMode::Thru {
        return Ok(Box::new(ThruCodec::new(id)));
    }
    match id {
        CodecId::Pcm => Ok(Box::new(PcmCodec::new())),
        CodecId::Flac | CodecId::Mp3 | CodecId::Aac | CodecId::Alac | CodecId::Vorbis => {
            Ok(Box::new(SymphoniaCodec::new(id)))
        }
    }
}

/// Codec ids this build can decode, in negotiation preference order.
pub const SUPPORTED: &[CodecId] = &[
    CodecId::Flac,
    CodecId::Pcm,
    CodecId::Mp3,
    CodecId::Aac,
    CodecId::Alac,
    CodecId::Vorbis,
];

pub fn supports(id: CodecId) -> bool {
    SUPPORTED.contains(&id)
}

#[cfg(test)]
pub(crate) mod test_sink {
    use super::CodecSink;

    /// Unbounded sink capturing everything, for codec unit tests.
    #[derive(Default)]
    pub struct VecSink {
        pub rate: Option<u32>,
        pub frames: Vec<i32>,
        pub bytes: Vec<u8>,
        /// Frames accepted per `write_frames` call; `usize::MAX` = all.
        pub accept_limit: usize,
    }

    impl VecSink {
        pub fn new() -> Self {
            Self {
                accept_limit: usize::MAX,
                ..Self::default()
            }
        }
    }

    impl CodecSink for VecSink {
        fn set_rate(&mut self, rate: u32) {
            self.rate = Some(rate);
        }

        fn write_frames(&mut self, frames: &[i32]) -> usize {
            let take_frames = (frames.len() / 2).min(self.accept_limit);
            self.frames.extend_from_slice(&frames[..take_frames * 2]);
            take_frames
        }

        fn write_bytes(&mut self, bytes: &[u8]) -> usize {
            self.bytes.extend_from_slice(bytes);
            bytes.len()
        }

        fn space_frames(&self) -> usize {
            // Clamp so codecs can scale this by bytes-per-frame without
            // overflowing when the limit is the "unbounded" sentinel.
            self.accept_limit.min(usize::MAX / 64)
        }
    }
}
