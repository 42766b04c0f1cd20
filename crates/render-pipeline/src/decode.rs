//! Decode stage: drives a codec to turn compressed bytes from the input
//! ring into 32-bit interleaved samples in the output ring.
//!
//! Pacing is cooperative on both sides. A decode step only runs when the
//! input ring holds at least the codec's minimum readable bytes (waived once
//! the stream has ended, so tails drain) and the sink can take the codec's
//! minimum writable space. Neither gate blocks; a stalled step is a no-op
//! and the stage thread parks on its wake.

use std::sync::Arc;

use render_bridge_types::{CodecId, DecodePhase, EncodeMode, SampleFormat};

use crate::buffer::{BYTES_PER_FRAME, RingBuffer};
use crate::codec::{Codec, CodecParams, CodecSink, DecodeContext, DecodeOutcome, new_codec};
use crate::error::Result;
use crate::process::Transform;

const TRANSFORM_CHUNK_FRAMES: usize = 1024;

/// Routes decoded samples through the rate transform into the output ring.
///
/// Owns the renderer-rate decision: when the source rate is in the supported
/// set the transform is bypassed entirely, otherwise audio is resampled to
/// the best supported rate.
pub struct OutputSink {
    outputbuf: Arc<RingBuffer>,
    transform: Transform,
    supported_rates: Vec<u32>,
    in_rate: u32,
    out_rate: u32,
    frames_written: u64,
    /// Transformed samples the ring had no room for yet.
    staged: Vec<i32>,
}

impl OutputSink {
    pub fn new(outputbuf: Arc<RingBuffer>, supported_rates: Vec<u32>) -> Self {
        Self {
            outputbuf,
            transform: Transform::new(TRANSFORM_CHUNK_FRAMES),
            supported_rates,
            in_rate: 0,
            out_rate: 0,
            frames_written: 0,
            staged: Vec::new(),
        }
    }

    /// The rate audio leaves the pipeline at, once known.
    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn is_direct(&self) -> bool {
        self.transform.is_direct()
    }

    fn pick_out_rate(&self, in_rate: u32) -> u32 {
        if self.supported_rates.is_empty() || self.supported_rates.contains(&in_rate) {
            return in_rate;
        }
        // Prefer the lowest supported rate above the source, else the
        // highest available.
        self.supported_rates
            .iter()
            .copied()
            .filter(|&r| r >= in_rate)
            .min()
            .or_else(|| self.supported_rates.iter().copied().max())
            .unwrap_or(in_rate)
    }

    /// Move staged samples into the ring, whole frames only.
    fn flush_staged(&mut self) {
        if self.staged.is_empty() {
            return;
        }
        let space_samples = self.outputbuf.space() / (BYTES_PER_FRAME / 2);
        let n = space_samples.min(self.staged.len()) & !1;
        if n == 0 {
            return;
        }
        let mut bytes = Vec::with_capacity(n * 4);
        for s in &self.staged[..n] {
            bytes.extend_from_slice(&s.to_ne_bytes());
        }
        self.outputbuf.write(&bytes);
        self.staged.drain(..n);
        self.frames_written += (n / 2) as u64;
    }

    /// End-of-track: push the transform tail out.
    pub fn finalize(&mut self) {
        let mut tail = Vec::new();
        self.transform.drain(&mut tail);
        self.staged.extend_from_slice(&tail);
        self.flush_staged();
    }

    /// Samples still held back waiting for ring space.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Retry moving held samples; returns true if any moved.
    pub fn pump(&mut self) -> bool {
        let before = self.staged.len();
        self.flush_staged();
        self.staged.len() != before
    }

    pub fn reset(&mut self) {
        self.staged.clear();
        self.transform.flush();
        self.frames_written = 0;
        self.in_rate = 0;
        self.out_rate = 0;
    }
}

impl CodecSink for OutputSink {
    fn set_rate(&mut self, rate: u32) {
        if rate == self.in_rate {
            return;
        }
        self.in_rate = rate;
        self.out_rate = self.pick_out_rate(rate);
        if let Err(err) = self.transform.new_stream(rate, self.out_rate) {
            tracing::error!(error = %err, "transform arm failed, passing through");
            self.out_rate = rate;
        }
        tracing::info!(
            in_rate = rate,
            out_rate = self.out_rate,
            direct = self.transform.is_direct(),
            "decode rate set"
        );
    }

    fn write_frames(&mut self, frames: &[i32]) -> usize {
        self.flush_staged();
        if !self.staged.is_empty() {
            return 0;
        }
        self.transform.process(frames, &mut self.staged);
        self.flush_staged();
        frames.len() / 2
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        let n = self.outputbuf.space().min(bytes.len());
        self.outputbuf.write(&bytes[..n])
    }

    fn space_frames(&self) -> usize {
        if !self.staged.is_empty() {
            return 0;
        }
        self.outputbuf.space() / BYTES_PER_FRAME
    }
}

pub struct DecodeStage {
    phase: DecodePhase,
    codec: Option<Box<dyn Codec>>,
    /// Set on `new_stream`, consumed by the output stage to re-derive
    /// downstream format.
    new_stream: bool,
}

impl DecodeStage {
    pub fn new() -> Self {
        Self {
            phase: DecodePhase::Stopped,
            codec: None,
            new_stream: false,
        }
    }

    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    pub fn take_new_stream(&mut self) -> bool {
        std::mem::take(&mut self.new_stream)
    }

    /// Select and open the codec for an announced track.
    pub fn new_stream(
        &mut self,
        id: CodecId,
        mode: EncodeMode,
        format: SampleFormat,
        total_bytes: Option<u64>,
    ) -> Result<()> {
        self.flush();
        let mut codec = new_codec(id, mode)?;
        codec.open(&CodecParams {
            id,
            format,
            total_bytes,
        })?;
        tracing::info!(codec = %id.as_char(), ?mode, "decode armed");
        self.codec = Some(codec);
        self.phase = DecodePhase::Ready;
        self.new_stream = true;
        Ok(())
    }

    /// One decode step. Returns true when the codec ran (progress), false
    /// when gated on input or output availability.
    pub fn run_once(
        &mut self,
        streambuf: &RingBuffer,
        sink: &mut OutputSink,
        stream_ended: bool,
    ) -> bool {
        if !matches!(self.phase, DecodePhase::Ready | DecodePhase::Running) {
            // Keep draining staged samples after completion.
            return sink.pump();
        }
        let Some(codec) = self.codec.as_mut() else {
            return false;
        };
        let input_ready = streambuf.used() >= codec.min_read_bytes() || stream_ended;
        let output_ready = sink.space_frames() >= codec.min_space();
        if !input_ready || !output_ready {
            return false;
        }
        self.phase = DecodePhase::Running;
        let mut cx = DecodeContext {
            streambuf,
            sink,
            stream_ended,
        };
        match codec.decode(&mut cx) {
            DecodeOutcome::Running => {}
            DecodeOutcome::Complete => {
                sink.finalize();
                codec.close();
                self.codec = None;
                self.phase = DecodePhase::Complete;
                tracing::info!(frames = sink.frames_written(), "decode complete");
            }
            DecodeOutcome::Error => {
                codec.close();
                self.codec = None;
                self.phase = DecodePhase::Error;
                tracing::warn!("decode error, track abandoned");
            }
        }
        true
    }

    /// Discard codec state; used on seek/stop.
    pub fn flush(&mut self) {
        if let Some(mut codec) = self.codec.take() {
            codec.close();
        }
        self.phase = DecodePhase::Stopped;
        self.new_stream = false;
    }
}

impl Default for DecodeStage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_stage() -> DecodeStage {
        let mut d = DecodeStage::new();
        d.new_stream(
            CodecId::Pcm,
            EncodeMode::Pcm,
            SampleFormat::default(),
            None,
        )
        .unwrap();
        d
    }

    #[test]
    fn decodes_pcm_into_output_ring() {
        let streambuf = RingBuffer::new(64 * 1024);
        let outputbuf = Arc::new(RingBuffer::new(256 * 1024));
        let mut sink = OutputSink::new(Arc::clone(&outputbuf), vec![44_100]);
        let mut d = pcm_stage();
        assert!(d.take_new_stream());
        assert!(!d.take_new_stream());

        // 1000 frames of 16-bit LE stereo.
        let mut src = Vec::new();
        for i in 0..1000i16 {
            src.extend_from_slice(&i.to_le_bytes());
            src.extend_from_slice(&(-i).to_le_bytes());
        }
        streambuf.write(&src);

        while d.phase() != DecodePhase::Complete {
            assert_ne!(d.phase(), DecodePhase::Error);
            d.run_once(&streambuf, &mut sink, true);
        }
        assert!(sink.is_direct());
        // 4 source bytes expand to 8 output bytes per frame.
        assert_eq!(outputbuf.used(), 1000 * BYTES_PER_FRAME);
        assert_eq!(sink.frames_written(), 1000);

        let mut first = [0u8; 8];
        outputbuf.read(&mut first);
        assert_eq!(i32::from_ne_bytes(first[0..4].try_into().unwrap()), 0);
    }

    #[test]
    fn stalls_when_output_lacks_space() {
        let streambuf = RingBuffer::new(64 * 1024);
        // Room for fewer frames than the codec's minimum space.
        let outputbuf = Arc::new(RingBuffer::new(64));
        let mut sink = OutputSink::new(Arc::clone(&outputbuf), vec![44_100]);
        let mut d = pcm_stage();

        streambuf.write(&vec![0u8; 4096]);
        assert!(!d.run_once(&streambuf, &mut sink, false));
        assert_eq!(outputbuf.used(), 0);
        assert_eq!(streambuf.used(), 4096);
    }

    #[test]
    fn stalls_when_input_below_minimum_and_stream_open() {
        let streambuf = RingBuffer::new(64 * 1024);
        let outputbuf = Arc::new(RingBuffer::new(256 * 1024));
        let mut sink = OutputSink::new(Arc::clone(&outputbuf), vec![44_100]);
        let mut d = pcm_stage();

        streambuf.write(&[0u8; 2]); // below one source frame
        assert!(!d.run_once(&streambuf, &mut sink, false));
        // Stream end waives the input gate so the tail drains.
        assert!(d.run_once(&streambuf, &mut sink, true));
        assert_eq!(d.phase(), DecodePhase::Complete);
    }

    #[test]
    fn resampled_stream_finalizes_tail() {
        let streambuf = RingBuffer::new(64 * 1024);
        let outputbuf = Arc::new(RingBuffer::new(1024 * 1024));
        // Renderer only supports 48 kHz; source is 44.1.
        let mut sink = OutputSink::new(Arc::clone(&outputbuf), vec![48_000]);
        let mut d = pcm_stage();

        let mut src = Vec::new();
        for _ in 0..2000 {
            src.extend_from_slice(&1000i16.to_le_bytes());
            src.extend_from_slice(&1000i16.to_le_bytes());
        }
        streambuf.write(&src);
        while d.phase() != DecodePhase::Complete {
            assert_ne!(d.phase(), DecodePhase::Error);
            d.run_once(&streambuf, &mut sink, true);
        }
        assert!(!sink.is_direct());
        assert_eq!(sink.out_rate(), 48_000);
        let out_frames = outputbuf.used() / BYTES_PER_FRAME;
        // 2000 frames at 44.1k is about 2177 at 48k, plus the transform's
        // padded tail and filter-delay flush.
        assert!(out_frames > 2100 && out_frames < 3600, "{out_frames}");
    }

    #[test]
    fn flush_discards_codec() {
        let streambuf = RingBuffer::new(1024);
        let outputbuf = Arc::new(RingBuffer::new(1024));
        let mut sink = OutputSink::new(Arc::clone(&outputbuf), vec![]);
        let mut d = pcm_stage();
        d.flush();
        assert_eq!(d.phase(), DecodePhase::Stopped);
        assert!(!d.run_once(&streambuf, &mut sink, true));
    }
}
