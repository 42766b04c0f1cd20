//! Fade and crossfade engine.
//!
//! Gains are 16.16 fixed point. Linear ramps run over a window measured in
//! frames and are applied while samples are pulled out of the output ring,
//! so the ring itself always holds unfaded audio.
//!
//! Crossfade leans on ring geometry: when the outgoing track's unread tail
//! has shrunk to exactly the fade window, the incoming track's first frame
//! sits at a fixed byte offset behind the read cursor (the window size), and
//! stays there as both sides advance in lockstep. Mixing therefore reads the
//! outgoing frame at the cursor and peeks the incoming frame at that
//! constant offset, then skips the already-mixed incoming window when done.
//!
//! A fade requested exactly at a track boundary associates with the track
//! the ring's unread tail belongs to (the one still playing).

use render_bridge_types::FadeMode;

use crate::buffer::{BYTES_PER_FRAME, RingBuffer};

/// Unity gain in 16.16 fixed point.
pub const FIXED_ONE: u32 = 0x10000;

pub fn apply_gain(sample: i32, gain: u32) -> i32 {
    ((sample as i64 * gain as i64) >> 16) as i32
}

/// Scale a whole interleaved buffer in place. Unity gain is a no-op.
pub fn apply_gain_samples(samples: &mut [i32], gain: u32) {
    if gain == FIXED_ONE {
        return;
    }
    for s in samples {
        *s = apply_gain(*s, gain);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadePhase {
    Inactive,
    /// Armed; waiting for its trigger point in the stream.
    Due,
    Active,
    /// Requested while another fade is active; promoted when it finishes.
    Pending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeDir {
    Up,
    Down,
    Cross,
}

pub struct FadeEngine {
    mode: FadeMode,
    duration_ms: u32,
    phase: FadePhase,
    dir: FadeDir,
    total_frames: usize,
    done_frames: usize,
    /// Outgoing-track bytes left in the ring ahead of the boundary (Cross).
    old_tail_bytes: usize,
    pending_tail_bytes: usize,
}

impl FadeEngine {
    pub fn new() -> Self {
        Self {
            mode: FadeMode::None,
            duration_ms: 0,
            phase: FadePhase::Inactive,
            dir: FadeDir::Up,
            total_frames: 0,
            done_frames: 0,
            old_tail_bytes: 0,
            pending_tail_bytes: 0,
        }
    }

    pub fn configure(&mut self, mode: FadeMode, duration_ms: u32) {
        self.mode = mode;
        self.duration_ms = duration_ms;
    }

    pub fn mode(&self) -> FadeMode {
        self.mode
    }

    pub fn phase(&self) -> FadePhase {
        if self.phase == FadePhase::Active && self.pending_tail_bytes > 0 {
            return FadePhase::Pending;
        }
        self.phase
    }

    pub fn reset(&mut self) {
        self.phase = FadePhase::Inactive;
        self.total_frames = 0;
        self.done_frames = 0;
        self.old_tail_bytes = 0;
        self.pending_tail_bytes = 0;
    }

    fn window_frames(&self, rate: u32) -> usize {
        (self.duration_ms as u64 * rate as u64 / 1000) as usize
    }

    /// Arm a fade-in at track start.
    pub fn start_in(&mut self, rate: u32) {
        if !matches!(self.mode, FadeMode::FadeIn | FadeMode::FadeInOut) {
            return;
        }
        let total = self.window_frames(rate);
        if total < 2 {
            return;
        }
        self.phase = FadePhase::Active;
        self.dir = FadeDir::Up;
        self.total_frames = total;
        self.done_frames = 0;
        tracing::debug!(frames = total, "fade-in active");
    }

    /// Arm a fade-out once the end of track is in sight. `remaining_frames`
    /// is the unplayed frame count; returns true when the fade activated.
    pub fn start_out(&mut self, remaining_frames: usize, rate: u32) -> bool {
        if !matches!(self.mode, FadeMode::FadeOut | FadeMode::FadeInOut) {
            return false;
        }
        if self.phase != FadePhase::Inactive {
            return false;
        }
        let window = self.window_frames(rate);
        if window < 2 || remaining_frames > window {
            return false;
        }
        self.phase = FadePhase::Active;
        self.dir = FadeDir::Down;
        self.total_frames = remaining_frames;
        self.done_frames = 0;
        tracing::debug!(frames = remaining_frames, "fade-out active");
        true
    }

    /// Arm a crossfade at a track boundary. `old_tail_bytes` is the unread
    /// outgoing audio in the ring at the moment the boundary was detected.
    pub fn arm_cross(&mut self, old_tail_bytes: usize, rate: u32) {
        if self.mode != FadeMode::Crossfade {
            return;
        }
        let window = self
            .window_frames(rate)
            .min(old_tail_bytes / BYTES_PER_FRAME);
        if window < 2 {
            return;
        }
        if self.phase == FadePhase::Active {
            // Queue behind the in-flight fade; promoted when it finishes.
            self.pending_tail_bytes = old_tail_bytes;
            return;
        }
        self.phase = FadePhase::Due;
        self.dir = FadeDir::Cross;
        self.total_frames = window;
        self.done_frames = 0;
        self.old_tail_bytes = old_tail_bytes;
        tracing::debug!(frames = window, tail = old_tail_bytes, "crossfade armed");
    }

    /// Ramp gain for frame `i` of `total`, endpoint-exact: frame 0 is 0,
    /// frame total-1 is unity.
    fn ramp(i: usize, total: usize) -> u32 {
        debug_assert!(total >= 2);
        ((i as u64 * FIXED_ONE as u64) / (total as u64 - 1)) as u32
    }

    /// Pull up to `max_frames` from the ring with fades applied, appending
    /// interleaved samples to `out`. `incoming_ready` tells a due crossfade
    /// whether the incoming track has buffered enough to start mixing (or
    /// has finished decoding with whatever it has).
    pub fn pull_frames(
        &mut self,
        ring: &RingBuffer,
        max_frames: usize,
        incoming_ready: bool,
        out: &mut Vec<i32>,
    ) -> usize {
        if max_frames == 0 {
            return 0;
        }
        match (self.phase, self.dir) {
            (FadePhase::Due, FadeDir::Cross) => self.pull_due_cross(ring, max_frames, incoming_ready, out),
            (FadePhase::Active, FadeDir::Cross) => self.pull_mix(ring, max_frames, out),
            (FadePhase::Active, _) => self.pull_ramp(ring, max_frames, out),
            _ => pull_plain(ring, max_frames, out),
        }
    }

    /// Before a crossfade activates, plain playback continues but must stop
    /// exactly at the fade window boundary.
    fn pull_due_cross(
        &mut self,
        ring: &RingBuffer,
        max_frames: usize,
        incoming_ready: bool,
        out: &mut Vec<i32>,
    ) -> usize {
        let window_bytes = self.total_frames * BYTES_PER_FRAME;
        let plain_bytes = self.old_tail_bytes.saturating_sub(window_bytes);
        if plain_bytes > 0 {
            let n = pull_plain(ring, max_frames.min(plain_bytes / BYTES_PER_FRAME), out);
            self.old_tail_bytes -= n * BYTES_PER_FRAME;
            return n;
        }
        // At the boundary; wait for the incoming side to buffer the full
        // window unless its decode already finished.
        let have = ring.used();
        if have >= 2 * window_bytes {
            self.phase = FadePhase::Active;
            tracing::debug!(frames = self.total_frames, "crossfade active");
            return self.pull_mix(ring, max_frames, out);
        }
        if incoming_ready {
            // Incoming track is shorter than the fade window; the offset
            // geometry no longer holds, so play the boundary plain.
            tracing::debug!("crossfade cancelled, incoming too short");
            self.phase = FadePhase::Inactive;
            return pull_plain(ring, max_frames, out);
        }
        0
    }

    fn pull_mix(&mut self, ring: &RingBuffer, max_frames: usize, out: &mut Vec<i32>) -> usize {
        let offset = self.total_frames * BYTES_PER_FRAME;
        let left = self.total_frames - self.done_frames;
        let n = max_frames.min(left);
        let mut outgoing = [0u8; BYTES_PER_FRAME];
        let mut incoming = [0u8; BYTES_PER_FRAME];
        let mut produced = 0;
        for _ in 0..n {
            if ring.peek_at(offset, &mut incoming) < BYTES_PER_FRAME {
                break;
            }
            if ring.read(&mut outgoing) < BYTES_PER_FRAME {
                break;
            }
            let g_in = Self::ramp(self.done_frames, self.total_frames);
            let g_out = FIXED_ONE - g_in;
            for ch in 0..2 {
                let o = i32::from_ne_bytes(outgoing[ch * 4..ch * 4 + 4].try_into().unwrap_or([0; 4]));
                let i = i32::from_ne_bytes(incoming[ch * 4..ch * 4 + 4].try_into().unwrap_or([0; 4]));
                let mixed = apply_gain(o, g_out) as i64 + apply_gain(i, g_in) as i64;
                out.push(mixed.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
            }
            self.done_frames += 1;
            produced += 1;
        }
        if self.done_frames == self.total_frames {
            // The incoming window was consumed by the mix; drop it.
            ring.skip(offset);
            self.finish();
        }
        produced
    }

    fn pull_ramp(&mut self, ring: &RingBuffer, max_frames: usize, out: &mut Vec<i32>) -> usize {
        let left = self.total_frames - self.done_frames;
        let n = pull_plain(ring, max_frames.min(left), out);
        let base = out.len() - n * 2;
        for f in 0..n {
            let gain = match self.dir {
                FadeDir::Up => Self::ramp(self.done_frames + f, self.total_frames),
                _ => FIXED_ONE - Self::ramp(self.done_frames + f, self.total_frames),
            };
            out[base + f * 2] = apply_gain(out[base + f * 2], gain);
            out[base + f * 2 + 1] = apply_gain(out[base + f * 2 + 1], gain);
        }
        self.done_frames += n;
        if self.done_frames == self.total_frames {
            self.finish();
        }
        n
    }

    fn finish(&mut self) {
        if self.pending_tail_bytes > 0 {
            let tail = self.pending_tail_bytes;
            self.pending_tail_bytes = 0;
            self.phase = FadePhase::Inactive;
            self.done_frames = 0;
            // Re-arm with the rate-independent window already computed.
            let window = self.total_frames.min(tail / BYTES_PER_FRAME);
            if window >= 2 {
                self.phase = FadePhase::Due;
                self.dir = FadeDir::Cross;
                self.total_frames = window;
                self.old_tail_bytes = tail;
                return;
            }
        }
        self.phase = FadePhase::Inactive;
        self.done_frames = 0;
        self.total_frames = 0;
    }
}

impl Default for FadeEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Read whole frames without fading.
fn pull_plain(ring: &RingBuffer, max_frames: usize, out: &mut Vec<i32>) -> usize {
    let frames = max_frames.min(ring.used() / BYTES_PER_FRAME);
    if frames == 0 {
        return 0;
    }
    let mut bytes = vec![0u8; frames * BYTES_PER_FRAME];
    let got = ring.read(&mut bytes) / BYTES_PER_FRAME;
    for chunk in bytes[..got * BYTES_PER_FRAME].chunks_exact(4) {
        out.push(i32::from_ne_bytes(chunk.try_into().unwrap_or([0; 4])));
    }
    got
}
