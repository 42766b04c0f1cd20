//! Renderer-side framing: pack internal 32-bit samples into the wire
//! format and produce WAV/AIFF container headers when asked for.
//!
//! Re-encode modes without a backing encoder degrade to PCM framing so the
//! stream stays playable; the degradation is logged once per track.

use render_bridge_types::{CodecId, EncodeMode, PcmFraming};

pub struct Encoder {
    mode: EncodeMode,
    framing: PcmFraming,
    sample_bits: u8,
    rate: u32,
}

impl Encoder {
    pub fn new(mode: EncodeMode, framing: PcmFraming, sample_bits: u8) -> Self {
        let sample_bits = match sample_bits {
            16 | 24 | 32 => sample_bits,
            _ => 16,
        };
        Self {
            mode,
            framing,
            sample_bits,
            rate: 0,
        }
    }

    pub fn mode(&self) -> EncodeMode {
        self.mode
    }

    /// Output bytes per stereo frame (0 for pass-through, where framing is
    /// the source's business).
    pub fn bytes_per_frame(&self) -> usize {
        if self.mode == EncodeMode::Thru {
            return 0;
        }
        self.sample_bits as usize / 8 * 2
    }

    pub fn start_track(&mut self, rate: u32) {
        self.rate = rate;
        if matches!(self.mode, EncodeMode::Flac | EncodeMode::Mp3) {
            tracing::warn!(
                ?self.mode,
                "re-encode mode has no encoder backend, serving pcm framing"
            );
        }
    }

    /// Container header to send before the first audio byte. Empty for
    /// pass-through and raw framing.
    pub fn header(&self, duration_frames: Option<u64>) -> Vec<u8> {
        if self.mode == EncodeMode::Thru {
            return Vec::new();
        }
        match self.framing {
            PcmFraming::Raw => Vec::new(),
            PcmFraming::Wav => self.wav_header(duration_frames),
            PcmFraming::Aiff => self.aiff_header(duration_frames),
        }
    }

    fn data_len(&self, duration_frames: Option<u64>) -> u32 {
        duration_frames
            .and_then(|f| u32::try_from(f * self.bytes_per_frame() as u64).ok())
            // Unknown length: claim the maximum, renderers stop at EOF.
            .unwrap_or(u32::MAX - 44)
    }

    fn wav_header(&self, duration_frames: Option<u64>) -> Vec<u8> {
        let data_len = self.data_len(duration_frames);
        let block_align = self.bytes_per_frame() as u16;
        let mut h = Vec::with_capacity(44);
        h.extend_from_slice(b"RIFF");
        h.extend_from_slice(&(data_len.saturating_add(36)).to_le_bytes());
        h.extend_from_slice(b"WAVE");
        h.extend_from_slice(b"fmt ");
        h.extend_from_slice(&16u32.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes());
        h.extend_from_slice(&2u16.to_le_bytes());
        h.extend_from_slice(&self.rate.to_le_bytes());
        h.extend_from_slice(&(self.rate * block_align as u32).to_le_bytes());
        h.extend_from_slice(&block_align.to_le_bytes());
        h.extend_from_slice(&(self.sample_bits as u16).to_le_bytes());
        h.extend_from_slice(b"data");
        h.extend_from_slice(&data_len.to_le_bytes());
        h
    }

    fn aiff_header(&self, duration_frames: Option<u64>) -> Vec<u8> {
        let frames = duration_frames
            .and_then(|f| u32::try_from(f).ok())
            .unwrap_or(u32::MAX / 8);
        let data_len = frames.saturating_mul(self.bytes_per_frame() as u32);
        let mut h = Vec::with_capacity(54);
        h.extend_from_slice(b"FORM");
        h.extend_from_slice(&(data_len.saturating_add(46)).to_be_bytes());
        h.extend_from_slice(b"AIFF");
        h.extend_from_slice(b"COMM");
        h.extend_from_slice(&18u32.to_be_bytes());
        h.extend_from_slice(&2u16.to_be_bytes());
        h.extend_from_slice(&frames.to_be_bytes());
        h.extend_from_slice(&(self.sample_bits as u16).to_be_bytes());
        h.extend_from_slice(&extended_rate(self.rate));
        h.extend_from_slice(b"SSND");
        h.extend_from_slice(&(data_len.saturating_add(8)).to_be_bytes());
        h.extend_from_slice(&0u32.to_be_bytes());
        h.extend_from_slice(&0u32.to_be_bytes());
        h
    }

    /// Pack interleaved samples into wire bytes. WAV is little endian, AIFF
    /// and raw (`audio/L16` family) are big endian.
    pub fn encode(&self, samples: &[i32], out: &mut Vec<u8>) {
        let big = self.framing != PcmFraming::Wav;
        out.reserve(samples.len() * self.sample_bits as usize / 8);
        for &s in samples {
            match self.sample_bits {
                16 => {
                    let v = (s >> 16) as i16;
                    let b = if big { v.to_be_bytes() } else { v.to_le_bytes() };
                    out.extend_from_slice(&b);
                }
                24 => {
                    let b = s.to_be_bytes();
                    if big {
                        out.extend_from_slice(&b[0..3]);
                    } else {
                        out.extend_from_slice(&[b[2], b[1], b[0]]);
                    }
                }
                _ => {
                    let b = if big { s.to_be_bytes() } else { s.to_le_bytes() };
                    out.extend_from_slice(&b);
                }
            }
        }
    }

    /// Content type for the renderer response.
    pub fn mime(&self, codec: CodecId) -> String {
        if self.mode == EncodeMode::Thru {
            return match codec {
                CodecId::Pcm => self.raw_mime(),
                CodecId::Flac => "audio/flac".to_owned(),
                CodecId::Mp3 => "audio/mpeg".to_owned(),
                CodecId::Aac => "audio/aac".to_owned(),
                CodecId::Alac => "audio/m4a".to_owned(),
                CodecId::Vorbis => "audio/ogg".to_owned(),
            };
        }
        match self.framing {
            PcmFraming::Wav => "audio/wav".to_owned(),
            PcmFraming::Aiff => "audio/aiff".to_owned(),
            PcmFraming::Raw => self.raw_mime(),
        }
    }

    fn raw_mime(&self) -> String {
        format!(
            "audio/L{};rate={};channels=2",
            self.sample_bits, self.rate
        )
    }
}

/// 80-bit IEEE 754 extended float, big endian, as AIFF wants sample rates.
fn extended_rate(rate: u32) -> [u8; 10] {
    let mut out = [0u8; 10];
    if rate == 0 {
        return out;
    }
    let top = 31 - rate.leading_zeros();
    let exponent = (16383 + top) as u16;
    let mantissa = (rate as u64) << (63 - top);
    out[0..2].copy_from_slice(&exponent.to_be_bytes());
    out[2..10].copy_from_slice(&mantissa.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_fields() {
        let mut e = Encoder::new(EncodeMode::Pcm, PcmFraming::Wav, 16);
        e.start_track(44_100);
        let h = e.header(Some(1000));
        assert_eq!(h.len(), 44);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(&h[8..12], b"WAVE");
        // Sample rate at offset 24, data length (1000 frames * 4) at 40.
        assert_eq!(u32::from_le_bytes(h[24..28].try_into().unwrap()), 44_100);
        assert_eq!(u32::from_le_bytes(h[40..44].try_into().unwrap()), 4000);
    }

    #[test]
    fn wav_header_unknown_length_is_maximal() {
        let mut e = Encoder::new(EncodeMode::Pcm, PcmFraming::Wav, 16);
        e.start_track(48_000);
        let h = e.header(None);
        let data_len = u32::from_le_bytes(h[40..44].try_into().unwrap());
        assert!(data_len > u32::MAX / 2);
    }

    #[test]
    fn aiff_extended_sample_rate() {
        assert_eq!(
            extended_rate(44_100),
            [0x40, 0x0E, 0xAC, 0x44, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            extended_rate(48_000),
            [0x40, 0x0E, 0xBB, 0x80, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn pack_16_bit_wav_is_little_endian() {
        let e = Encoder::new(EncodeMode::Pcm, PcmFraming::Wav, 16);
        let mut out = Vec::new();
        e.encode(&[0x1234_0000, -0x1234_0000], &mut out);
        assert_eq!(out, vec![0x34, 0x12, 0xcc, 0xed]);
    }

    #[test]
    fn pack_24_bit_aiff_is_big_endian() {
        let e = Encoder::new(EncodeMode::Pcm, PcmFraming::Aiff, 24);
        let mut out = Vec::new();
        e.encode(&[0x12_3456_00u32 as i32], &mut out);
        assert_eq!(out, vec![0x12, 0x34, 0x56]);
    }

    #[test]
    fn thru_mode_has_no_header_and_source_mime() {
        let mut e = Encoder::new(EncodeMode::Thru, PcmFraming::Wav, 16);
        e.start_track(44_100);
        assert!(e.header(None).is_empty());
        assert_eq!(e.bytes_per_frame(), 0);
        assert_eq!(e.mime(CodecId::Flac), "audio/flac");
    }

    #[test]
    fn raw_mime_carries_rate() {
        let mut e = Encoder::new(EncodeMode::Pcm, PcmFraming::Raw, 16);
        e.start_track(44_100);
        assert_eq!(e.mime(CodecId::Pcm), "audio/L16;rate=44100;channels=2");
    }
}
