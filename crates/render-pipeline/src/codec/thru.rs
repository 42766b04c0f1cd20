//! Pass-through "codec" for re-serving the source bytes untouched.
//!
//! Used when the renderer can decode the source format itself; the pipeline
//! then only moves bytes and re-frames the HTTP transfer. Sample-domain
//! features (fade, gain, resampling) do not apply on this path.

use super::{Codec, CodecParams, DecodeContext, DecodeOutcome};
use crate::error::Result;
use render_bridge_types::CodecId;

const CHUNK: usize = 4096;

pub struct ThruCodec {
    id: CodecId,
    rate_hint: u32,
    rate_announced: bool,
    /// Bytes pulled from the ring that the sink did not yet accept.
    pending: Vec<u8>,
}

impl ThruCodec {
    pub fn new(id: CodecId) -> Self {
        Self {
            id,
            rate_hint: 0,
            rate_announced: false,
            pending: Vec::new(),
        }
    }

    /// Offer `pending` to the sink, keeping whatever it refuses.
    fn flush_pending(&mut self, cx: &mut DecodeContext<'_>) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let taken = cx.sink.write_bytes(&self.pending);
        self.pending.drain(..taken);
        self.pending.is_empty()
    }
}

impl Codec for ThruCodec {
    fn id(&self) -> CodecId {
        self.id
    }

    fn min_read_bytes(&self) -> usize {
        1
    }

    fn min_space(&self) -> usize {
        1
    }

    fn open(&mut self, params: &CodecParams) -> Result<()> {
        self.rate_hint = params.format.rate;
        self.rate_announced = false;
        self.pending.clear();
        Ok(())
    }

    fn decode(&mut self, cx: &mut DecodeContext<'_>) -> DecodeOutcome {
        if !self.rate_announced {
            cx.sink.set_rate(self.rate_hint);
            self.rate_announced = true;
        }
        loop {
            if !self.flush_pending(cx) {
                return DecodeOutcome::Running;
            }
            let n = cx.streambuf.used().min(CHUNK);
            if n == 0 {
                break;
            }
            let mut chunk = vec![0u8; n];
            let got = cx.streambuf.read(&mut chunk);
            chunk.truncate(got);
            let taken = cx.sink.write_bytes(&chunk);
            if taken < chunk.len() {
                self.pending.extend_from_slice(&chunk[taken..]);
                return DecodeOutcome::Running;
            }
        }
        if cx.stream_ended {
            DecodeOutcome::Complete
        } else {
            DecodeOutcome::Running
        }
    }

    fn close(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;
    use crate::codec::test_sink::VecSink;
    use render_bridge_types::SampleFormat;

    fn open_thru() -> ThruCodec {
        let mut c = ThruCodec::new(CodecId::Flac);
        c.open(&CodecParams {
            id: CodecId::Flac,
            format: SampleFormat::default(),
            total_bytes: None,
        })
        .unwrap();
        c
    }

    #[test]
    fn forwards_bytes_unmodified() {
        let mut codec = open_thru();
        let rb = RingBuffer::new(64);
        rb.write(b"fLaC-data-here");
        let mut sink = VecSink::new();
        let mut cx = DecodeContext {
            streambuf: &rb,
            sink: &mut sink,
            stream_ended: true,
        };
        assert_eq!(codec.decode(&mut cx), DecodeOutcome::Complete);
        assert_eq!(sink.bytes, b"fLaC-data-here");
    }

    #[test]
    fn keeps_refused_bytes_for_the_next_step() {
        struct HalfSink(VecSink);
        impl super::super::CodecSink for HalfSink {
            fn set_rate(&mut self, rate: u32) {
                self.0.set_rate(rate);
            }
            fn write_frames(&mut self, frames: &[i32]) -> usize {
                self.0.write_frames(frames)
            }
            fn write_bytes(&mut self, bytes: &[u8]) -> usize {
                let take = bytes.len().div_ceil(2);
                self.0.write_bytes(&bytes[..take])
            }
            fn space_frames(&self) -> usize {
                self.0.space_frames()
            }
        }

        let mut codec = open_thru();
        let rb = RingBuffer::new(64);
        rb.write(b"abcdefgh");
        let mut sink = HalfSink(VecSink::new());
        let mut cx = DecodeContext {
            streambuf: &rb,
            sink: &mut sink,
            stream_ended: true,
        };
        assert_eq!(codec.decode(&mut cx), DecodeOutcome::Running);
        // Run steps until the retained tail drains.
        for _ in 0..8 {
            let mut cx = DecodeContext {
                streambuf: &rb,
                sink: &mut sink,
                stream_ended: true,
            };
            if codec.decode(&mut cx) == DecodeOutcome::Complete {
                break;
            }
        }
        assert_eq!(sink.0.bytes, b"abcdefgh");
    }
}
