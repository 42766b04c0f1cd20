//! Sample-rate transform between decode and the output ring.
//!
//! Rubato's streaming sinc resampler wants fixed-size interleaved `f32`
//! chunks; decoded audio arrives as interleaved `i32` in whatever burst the
//! codec produced. The transform buffers input up to the chunk size,
//! converts through `f32`, and hands back `i32` at the output rate. When the
//! source rate already matches the renderer rate the whole stage is a no-op
//! pass-through.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::{PipelineError, Result};

const CHANNELS: usize = 2;
const SCALE: f32 = 2147483648.0; // 2^31

pub struct Transform {
    resampler: Option<Box<dyn Resampler<f32>>>,
    chunk_frames: usize,
    in_rate: u32,
    out_rate: u32,
    /// Interleaved input awaiting a full chunk.
    pending: Vec<f32>,
    out_scratch: Vec<f32>,
}

fn sinc_params() -> SincInterpolationParameters {
    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    }
}

impl Transform {
    pub fn new(chunk_frames: usize) -> Self {
        Self {
            resampler: None,
            chunk_frames: chunk_frames.max(1),
            in_rate: 0,
            out_rate: 0,
            pending: Vec::new(),
            out_scratch: Vec::new(),
        }
    }

    /// Arm (or re-arm) the transform for a new track.
    pub fn new_stream(&mut self, in_rate: u32, out_rate: u32) -> Result<()> {
        self.pending.clear();
        self.in_rate = in_rate;
        self.out_rate = out_rate;
        if in_rate == out_rate || in_rate == 0 {
            self.resampler = None;
            return Ok(());
        }
        let f_ratio = out_rate as f64 / in_rate as f64;
        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &sinc_params(),
            self.chunk_frames,
            CHANNELS,
            FixedAsync::Input,
        )
        .map_err(|e| PipelineError::Transform(e.to_string()))?;
        self.out_scratch = vec![0.0; CHANNELS * self.chunk_frames * 3];
        self.resampler = Some(Box::new(resampler));
        tracing::debug!(in_rate, out_rate, "resampler armed");
        Ok(())
    }

    pub fn is_direct(&self) -> bool {
        self.resampler.is_none()
    }

    /// Push interleaved stereo samples through; converted output is appended
    /// to `out`. Input shorter than a chunk is held until more arrives.
    pub fn process(&mut self, samples: &[i32], out: &mut Vec<i32>) {
        if self.resampler.is_none() {
            out.extend_from_slice(samples);
            return;
        }
        self.pending.extend(samples.iter().map(|&s| s as f32 / SCALE));
        let chunk = self.chunk_frames * CHANNELS;
        while self.pending.len() >= chunk {
            let produced = self.run_chunk(chunk, None);
            self.pending.drain(..chunk);
            self.emit(produced, out);
        }
    }

    /// Flush the held tail and filter history at end of track.
    pub fn drain(&mut self, out: &mut Vec<i32>) {
        if self.resampler.is_none() {
            return;
        }
        let tail_frames = self.pending.len() / CHANNELS;
        if tail_frames > 0 {
            self.pending.resize(self.chunk_frames * CHANNELS, 0.0);
            let produced = self.run_chunk(self.pending.len(), Some(tail_frames));
            self.pending.clear();
            self.emit(produced, out);
        }
        // One zero-fed pass pushes out the sinc filter delay.
        self.pending.resize(self.chunk_frames * CHANNELS, 0.0);
        let produced = self.run_chunk(self.pending.len(), Some(0));
        self.pending.clear();
        self.emit(produced, out);
    }

    /// Drop held input without producing output.
    pub fn flush(&mut self) {
        self.pending.clear();
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
    }

    /// Run one resampler pass over the first `input_len` pending samples.
    /// Returns samples produced into the scratch buffer.
    fn run_chunk(&mut self, input_len: usize, partial_frames: Option<usize>) -> usize {
        let Some(resampler) = self.resampler.as_mut() else {
            return 0;
        };
        let in_frames = input_len / CHANNELS;
        let input_adapter = match InterleavedSlice::new(&self.pending[..input_len], CHANNELS, in_frames)
        {
            Ok(a) => a,
            Err(e) => {
                tracing::error!("interleaved slice (input) error: {e:#}");
                return 0;
            }
        };
        let out_capacity_frames = self.out_scratch.len() / CHANNELS;
        let mut output_adapter =
            match InterleavedSlice::new_mut(&mut self.out_scratch, CHANNELS, out_capacity_frames) {
                Ok(a) => a,
                Err(e) => {
                    tracing::error!("interleaved slice (output) error: {e:#}");
                    return 0;
                }
            };
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: partial_frames,
        };
        match resampler.process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing)) {
            Ok((_nbr_in, nbr_out)) => nbr_out * CHANNELS,
            Err(e) => {
                tracing::error!("resampler process error: {e:#}");
                0
            }
        }
    }

    fn emit(&self, produced: usize, out: &mut Vec<i32>) {
        out.extend(self.out_scratch[..produced].iter().map(|&f| {
            let v = f * SCALE;
            v.clamp(i32::MIN as f32, i32::MAX as f32) as i32
        }));
    }
}
