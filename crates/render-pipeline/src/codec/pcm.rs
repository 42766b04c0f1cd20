//! Raw PCM unpacker.
//!
//! The source format is fully described up front, so this codec is pure
//! sample surgery: widen to 32-bit, fix byte order, duplicate mono into
//! both channels. No probing, no framing.

use super::{Codec, CodecParams, DecodeContext, DecodeOutcome};
use crate::error::{PipelineError, Result};
use render_bridge_types::{CodecId, Endianness, SampleFormat};

const CHUNK_FRAMES: usize = 4096;

pub struct PcmCodec {
    format: SampleFormat,
    total_bytes: Option<u64>,
    consumed: u64,
    rate_announced: bool,
    open: bool,
}

impl PcmCodec {
    pub fn new() -> Self {
        Self {
            format: SampleFormat::default(),
            total_bytes: None,
            consumed: 0,
            rate_announced: false,
            open: false,
        }
    }

    /// Bytes of source still expected, if the length is known.
    fn remaining(&self) -> Option<u64> {
        self.total_bytes.map(|t| t.saturating_sub(self.consumed))
    }

    fn widen(&self, raw: &[u8]) -> i32 {
        let size = self.format.sample_size as usize / 8;
        let big = self.format.endianness == Endianness::Big;
        let mut v: i32 = 0;
        for i in 0..size {
            let b = if big { raw[i] } else { raw[size - 1 - i] };
            v = (v << 8) | b as i32;
        }
        // Sign-extend then left-justify into the full 32 bits.
        let shift = 32 - 8 * size as u32;
        (v << shift) as i32
    }

    fn unpack(&self, src: &[u8], out: &mut Vec<i32>) {
        let size = self.format.sample_size as usize / 8;
        let ch = self.format.channels as usize;
        let frame = size * ch;
        for f in src.chunks_exact(frame) {
            let left = self.widen(&f[..size]);
            let right = if ch >= 2 {
                self.widen(&f[size..2 * size])
            } else {
                left
            };
            out.push(left);
            out.push(right);
        }
    }
}

impl Default for PcmCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for PcmCodec {
    fn id(&self) -> CodecId {
        CodecId::Pcm
    }

    fn min_read_bytes(&self) -> usize {
        self.format.bytes_per_frame()
    }

    fn min_space(&self) -> usize {
        CHUNK_FRAMES
    }

    fn open(&mut self, params: &CodecParams) -> Result<()> {
        match params.format.sample_size {
            8 | 16 | 24 | 32 => {}
            other => {
                return Err(PipelineError::CodecOpen(format!(
                    "unsupported pcm sample size {other}"
                )));
            }
        }
        if params.format.channels == 0 {
            return Err(PipelineError::CodecOpen("zero channels".into()));
        }
        self.format = params.format;
        self.total_bytes = params.total_bytes;
        self.consumed = 0;
        self.rate_announced = false;
        self.open = true;
        Ok(())
    }

    fn decode(&mut self, cx: &mut DecodeContext<'_>) -> DecodeOutcome {
        if !self.open {
            return DecodeOutcome::Error;
        }
        if !self.rate_announced {
            cx.sink.set_rate(self.format.rate);
            self.rate_announced = true;
        }

        let frame = self.format.bytes_per_frame();
        let mut budget = cx.streambuf.used();
        if let Some(rem) = self.remaining() {
            budget = budget.min(rem as usize);
        }
        budget = budget
            .min(cx.sink.space_frames() * frame)
            .min(CHUNK_FRAMES * frame);
        budget -= budget % frame;

        if budget > 0 {
            let mut raw = vec![0u8; budget];
            let got = cx.streambuf.read(&mut raw);
            raw.truncate(got - got % frame);
            let mut frames = Vec::with_capacity(raw.len() / frame * 2);
            self.unpack(&raw, &mut frames);
            cx.sink.write_frames(&frames);
            self.consumed += raw.len() as u64;
        }

        let done_by_length = self.remaining() == Some(0);
        let done_by_eof = cx.stream_ended && cx.streambuf.used() < frame;
        if done_by_length || done_by_eof {
            // A straggling partial frame at end of stream is dropped.
            let tail = cx.streambuf.used().min(frame.saturating_sub(1));
            if cx.stream_ended && tail > 0 {
                cx.streambuf.skip(tail);
            }
            tracing::debug!(consumed = self.consumed, "pcm decode complete");
            return DecodeOutcome::Complete;
        }
        DecodeOutcome::Running
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;
    use crate::codec::test_sink::VecSink;

    fn params(format: SampleFormat, total: Option<u64>) -> CodecParams {
        CodecParams {
            id: CodecId::Pcm,
            format,
            total_bytes: total,
        }
    }

    #[test]
    fn widens_16_bit_little_endian_stereo() {
        let mut codec = PcmCodec::new();
        codec.open(&params(SampleFormat::default(), None)).unwrap();

        let rb = RingBuffer::new(1024);
        // Two frames: (0x0001, -1), (0x7fff, 0x8000 as i16)
        rb.write(&[0x01, 0x00, 0xff, 0xff, 0xff, 0x7f, 0x00, 0x80]);
        let mut sink = VecSink::new();
        let mut cx = DecodeContext {
            streambuf: &rb,
            sink: &mut sink,
            stream_ended: true,
        };
        assert_eq!(codec.decode(&mut cx), DecodeOutcome::Complete);
        assert_eq!(
            sink.frames,
            vec![1 << 16, -1 << 16, 0x7fff << 16, i32::MIN]
        );
        assert_eq!(sink.rate, Some(44_100));
    }

    #[test]
    fn duplicates_mono_into_both_channels() {
        let mut codec = PcmCodec::new();
        let fmt = SampleFormat {
            channels: 1,
            ..SampleFormat::default()
        };
        codec.open(&params(fmt, None)).unwrap();

        let rb = RingBuffer::new(64);
        rb.write(&[0x34, 0x12]);
        let mut sink = VecSink::new();
        let mut cx = DecodeContext {
            streambuf: &rb,
            sink: &mut sink,
            stream_ended: true,
        };
        assert_eq!(codec.decode(&mut cx), DecodeOutcome::Complete);
        assert_eq!(sink.frames, vec![0x1234 << 16, 0x1234 << 16]);
    }

    #[test]
    fn big_endian_24_bit() {
        let mut codec = PcmCodec::new();
        let fmt = SampleFormat {
            sample_size: 24,
            endianness: Endianness::Big,
            ..SampleFormat::default()
        };
        codec.open(&params(fmt, None)).unwrap();

        let rb = RingBuffer::new(64);
        rb.write(&[0x12, 0x34, 0x56, 0xff, 0xff, 0xff]);
        let mut sink = VecSink::new();
        let mut cx = DecodeContext {
            streambuf: &rb,
            sink: &mut sink,
            stream_ended: true,
        };
        assert_eq!(codec.decode(&mut cx), DecodeOutcome::Complete);
        assert_eq!(sink.frames, vec![0x123456 << 8, -1 << 8]);
    }

    #[test]
    fn runs_until_announced_length_consumed() {
        let mut codec = PcmCodec::new();
        codec
            .open(&params(SampleFormat::default(), Some(8)))
            .unwrap();

        let rb = RingBuffer::new(64);
        rb.write(&[0u8; 4]);
        let mut sink = VecSink::new();
        let mut cx = DecodeContext {
            streambuf: &rb,
            sink: &mut sink,
            stream_ended: false,
        };
        assert_eq!(codec.decode(&mut cx), DecodeOutcome::Running);
        rb.write(&[0u8; 4]);
        let mut cx = DecodeContext {
            streambuf: &rb,
            sink: &mut sink,
            stream_ended: false,
        };
        assert_eq!(codec.decode(&mut cx), DecodeOutcome::Complete);
        assert_eq!(sink.frames.len(), 4);
    }

    #[test]
    fn partial_trailing_frame_is_dropped() {
        let mut codec = PcmCodec::new();
        codec.open(&params(SampleFormat::default(), None)).unwrap();

        let rb = RingBuffer::new(64);
        rb.write(&[0u8; 7]); // one full frame plus 3 stray bytes
        let mut sink = VecSink::new();
        let mut cx = DecodeContext {
            streambuf: &rb,
            sink: &mut sink,
            stream_ended: true,
        };
        assert_eq!(codec.decode(&mut cx), DecodeOutcome::Complete);
        assert_eq!(sink.frames.len(), 2);
        assert_eq!(rb.used(), 0);
    }
}
