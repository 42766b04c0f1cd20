//! Output stage: drains the output ring, applies fades/gain/encoding and
//! ICY framing, and serves the result over HTTP to the renderer.
//!
//! The gapless hand-off works with up to two renderer connections per
//! player. The connection in the **Running** role is the only consumer of
//! the shared output ring; it fills a bounded per-connection transfer
//! buffer and streams from it. Once the ring is drained and decode has
//! reported completion, the connection hands the Running role back and
//! becomes **Draining**: it serves only its transfer buffer tail while a
//! new Running connection (for the next track) starts pulling fresh
//! samples. `track_complete` fires exactly at that transition, which is the
//! session layer's cue to start the next track. The transfer buffer size
//! bounds how early that cue can arrive relative to playback position.

pub mod encode;
pub mod fade;
pub mod http;
pub mod icy;

pub use http::OutputServer;

use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use render_bridge_types::{
    CodecId, EncodeMode, FadeMode, OutputPhase, PcmFraming, StatusEvent, TrackMetadata,
};

use crate::buffer::RingBuffer;
use crate::output::fade::{FIXED_ONE, FadeEngine};
use crate::wake::Wake;

/// Default per-connection transfer buffer: enough tail for a slow renderer
/// to finish a track while the next one spins up.
pub const TRANSFER_BUFFER_SIZE: usize = 2048 * 1024;

/// Mutable output state, guarded by one mutex so cross-stage flags are
/// never seen half-updated.
pub struct OutputControl {
    pub phase: OutputPhase,
    /// Role occupancy; the invariants are at most one of each.
    pub running_active: bool,
    pub draining_active: bool,
    /// Continuous-stream mode: one connection crosses track boundaries, so
    /// the Running role is never handed off.
    pub flow: bool,
    pub track_index: u16,
    pub started_emitted: bool,
    pub complete_emitted: bool,
    /// Mirrored from the decode stage under this lock.
    pub decode_complete: bool,
    pub decode_failed: bool,
    pub stop_requested: bool,
    pub fade: FadeEngine,
    /// Volume in 16.16 fixed point.
    pub gain: u32,
    pub replay_gain: u32,
    /// Replay gain for the next track, latched at the boundary.
    pub next_replay_gain: Option<u32>,
    pub rate: u32,
    pub codec: CodecId,
    pub encode_mode: EncodeMode,
    pub framing: PcmFraming,
    pub sample_bits: u8,
    /// ICY interval offered to renderers; 0 disables metadata.
    pub icy_interval: usize,
    pub metadata: TrackMetadata,
    pub duration_frames: Option<u64>,
    pub frames_played: u64,
    pub transfer_capacity: usize,
}

impl OutputControl {
    fn new() -> Self {
        Self {
            phase: OutputPhase::Stopped,
            running_active: false,
            draining_active: false,
            flow: false,
            track_index: 0,
            started_emitted: false,
            complete_emitted: false,
            decode_complete: false,
            decode_failed: false,
            stop_requested: false,
            fade: FadeEngine::new(),
            gain: FIXED_ONE,
            replay_gain: FIXED_ONE,
            next_replay_gain: None,
            rate: 0,
            codec: CodecId::Pcm,
            encode_mode: EncodeMode::Pcm,
            framing: PcmFraming::Wav,
            sample_bits: 16,
            icy_interval: 0,
            metadata: TrackMetadata::default(),
            duration_frames: None,
            frames_played: 0,
            transfer_capacity: TRANSFER_BUFFER_SIZE,
        }
    }

    /// Combined volume and replay gain.
    pub fn effective_gain(&self) -> u32 {
        ((self.gain as u64 * self.replay_gain as u64) >> 16) as u32
    }

    /// Re-arm per-track fields for a newly announced track. Fade geometry
    /// for a crossfade is anchored to the unread outgoing tail.
    pub fn start_track(&mut self, old_tail_bytes: usize) {
        self.track_index = self.track_index.wrapping_add(1);
        self.started_emitted = false;
        self.complete_emitted = false;
        self.decode_complete = false;
        self.decode_failed = false;
        self.stop_requested = false;
        if let Some(gain) = self.next_replay_gain.take() {
            self.replay_gain = gain;
        }
        if !self.flow {
            // Flow mode keeps one position across boundaries.
            self.frames_played = 0;
        }
        if self.rate > 0 {
            match self.fade.mode() {
                FadeMode::Crossfade if old_tail_bytes > 0 => {
                    self.fade.arm_cross(old_tail_bytes, self.rate);
                }
                _ => self.fade.start_in(self.rate),
            }
        }
    }
}

/// Shared hub between the pipeline context and the HTTP connection bodies.
pub struct OutputShared {
    pub outputbuf: Arc<RingBuffer>,
    pub control: Mutex<OutputControl>,
    /// Signalled when samples land in the ring or control state changes.
    pub wake: Wake,
    events: Sender<StatusEvent>,
}

impl OutputShared {
    pub fn new(outputbuf: Arc<RingBuffer>, events: Sender<StatusEvent>) -> Self {
        Self {
            outputbuf,
            control: Mutex::new(OutputControl::new()),
            wake: Wake::new(),
            events,
        }
    }

    pub fn emit(&self, event: StatusEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("status event dropped, no listener");
        }
    }

    pub fn with_control<T>(&self, f: impl FnOnce(&mut OutputControl) -> T) -> T {
        let mut guard = self.control.lock().unwrap();
        let out = f(&mut guard);
        drop(guard);
        self.wake.signal();
        out
    }

    pub fn phase(&self) -> OutputPhase {
        self.control.lock().unwrap().phase
    }
}
