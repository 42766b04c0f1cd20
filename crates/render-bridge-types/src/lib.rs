//! Shared plain types crossing the session-layer boundary.
//!
//! The pipeline crate and the bridge binary both depend on these; the session
//! layer (whatever drives a player) consumes the events and snapshots defined
//! here. Everything is serde-serializable so a control API can expose it
//! without translation.

use serde::{Deserialize, Serialize};

/// Why a stream source went away.
///
/// `LocalDisconnect` is a user/session initiated close and is never reported
/// as an error; the other codes are surfaced so the session layer can decide
/// whether to retry or advance.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCode {
    /// Clean end of stream (server closed after delivering everything).
    #[default]
    Ok,
    /// Close requested from our side.
    LocalDisconnect,
    /// Server closed the connection before the stream was complete.
    RemoteDisconnect,
    /// Connection could not be established.
    Unreachable,
    /// No data within the read timeout.
    Timeout,
}

/// Stream stage phase. Header phases only apply to HTTP sources.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    #[default]
    Stopped,
    Disconnected,
    WaitingForConnection,
    SendingHeaders,
    ReceivingHeaders,
    Buffering,
    StreamingHttp,
    StreamingFile,
}

/// Decode stage phase.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecodePhase {
    #[default]
    Stopped,
    Ready,
    Running,
    Complete,
    Error,
}

/// Output stage phase.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputPhase {
    Off,
    #[default]
    Stopped,
    Waiting,
    Running,
}

/// Identifier of the source codec announced by the session layer.
///
/// Mirrors the single-character codec ids of the upstream control protocol.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CodecId {
    Pcm,
    Flac,
    Mp3,
    Aac,
    Alac,
    Vorbis,
}

impl CodecId {
    /// Parse the protocol's one-character codec id.
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'p' => CodecId::Pcm,
            'f' => CodecId::Flac,
            'm' => CodecId::Mp3,
            'a' => CodecId::Aac,
            'l' => CodecId::Alac,
            'o' => CodecId::Vorbis,
            _ => return None,
        })
    }

    /// The protocol's one-character codec id.
    pub fn as_char(self) -> char {
        match self {
            CodecId::Pcm => 'p',
            CodecId::Flac => 'f',
            CodecId::Mp3 => 'm',
            CodecId::Aac => 'a',
            CodecId::Alac => 'l',
            CodecId::Vorbis => 'o',
        }
    }

    /// File extension hint handed to the decoder probe.
    pub fn extension(self) -> &'static str {
        match self {
            CodecId::Pcm => "raw",
            CodecId::Flac => "flac",
            CodecId::Mp3 => "mp3",
            CodecId::Aac => "aac",
            CodecId::Alac => "m4a",
            CodecId::Vorbis => "ogg",
        }
    }
}

/// Byte order of PCM samples on the wire.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Negotiated PCM sample format.
///
/// `sample_size` is in bits (8, 16, 24 or 32). The internal representation
/// between decode and output is always 32-bit native-endian stereo; this
/// struct describes the source format on input and the renderer format on
/// output.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleFormat {
    pub rate: u32,
    pub sample_size: u8,
    pub channels: u8,
    pub endianness: Endianness,
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self {
            rate: 44_100,
            sample_size: 16,
            channels: 2,
            endianness: Endianness::Little,
        }
    }
}

impl SampleFormat {
    /// Bytes per frame in this format.
    pub fn bytes_per_frame(&self) -> usize {
        (self.sample_size as usize / 8) * self.channels as usize
    }
}

/// How decoded audio is re-framed for the renderer.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EncodeMode {
    /// Compressed source bytes are forwarded untouched.
    Thru,
    /// Decoded PCM, framed per [`PcmFraming`].
    #[default]
    Pcm,
    /// Re-encode to FLAC (falls back to PCM framing, see DESIGN.md).
    Flac,
    /// Re-encode to MP3 (falls back to PCM framing, see DESIGN.md).
    Mp3,
}

/// Container framing used for PCM encode mode.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PcmFraming {
    /// Headerless big-endian PCM (`audio/L16` style).
    Raw,
    #[default]
    Wav,
    Aiff,
}

/// Fade behavior requested by the session layer.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FadeMode {
    #[default]
    None,
    Crossfade,
    FadeIn,
    FadeOut,
    FadeInOut,
}

/// Track metadata used for ICY injection and status reporting.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub artwork_url: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Asynchronous status events emitted by a player pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum StatusEvent {
    /// The renderer started pulling the track's audio.
    TrackStarted { index: u16 },
    /// The output ring buffer is drained and the tail is in the transfer
    /// buffer: the session layer may request the next track (gapless
    /// trigger). Emitted exactly once per track.
    TrackComplete { index: u16 },
    /// The upstream source went away.
    Disconnected { code: DisconnectCode },
    /// The current track could not be decoded; the pipeline is idle.
    DecodeError,
    /// The renderer dropped its connection mid-stream; playback stopped.
    PlaybackStopped,
    /// Periodic playback position report.
    PositionUpdate { ms_played: u64 },
}

/// Point-in-time view of a player pipeline, for status APIs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub stream_phase: StreamPhase,
    pub decode_phase: DecodePhase,
    pub output_phase: OutputPhase,
    /// Unread bytes in the input ring buffer.
    pub stream_full: usize,
    /// Input ring buffer capacity.
    pub stream_size: usize,
    /// Bytes received for the current stream.
    pub bytes_received: u64,
    /// Unread bytes in the output ring buffer.
    pub output_full: usize,
    /// Output ring buffer capacity.
    pub output_size: usize,
    pub sample_rate: u32,
    pub ms_played: u64,
    pub duration_ms: Option<u64>,
    /// True once the output stage is licensed to serve the renderer.
    pub output_ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_id_char_roundtrip() {
        for c in ['p', 'f', 'm', 'a', 'l', 'o'] {
            let id = CodecId::from_char(c).unwrap();
            assert_eq!(id.as_char(), c);
        }
        assert!(CodecId::from_char('x').is_none());
    }

    #[test]
    fn sample_format_bytes_per_frame() {
        let fmt = SampleFormat::default();
        assert_eq!(fmt.bytes_per_frame(), 4);
        let fmt = SampleFormat {
            sample_size: 24,
            channels: 2,
            ..fmt
        };
        assert_eq!(fmt.bytes_per_frame(), 6);
    }

    #[test]
    fn status_event_serializes_with_tag() {
        let ev = StatusEvent::Disconnected {
            code: DisconnectCode::Timeout,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"disconnected\""), "{json}");
        assert!(json.contains("timeout"), "{json}");
    }
}
