//! Per-player pipeline context.
//!
//! Owns both ring buffers, the three stage state machines, the renderer
//! HTTP listener and the stream/decode threads. The session layer drives it
//! through the synchronous calls (`open_stream`, `request_stop`, ...) and
//! listens on the status event channel; the stage threads run cooperative
//! poll loops parked on per-stage wakes.
//!
//! Lock order is stream stage, then decode stage, then output control.
//! Ring buffers have their own internal locks and are safe to touch from
//! any of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use render_bridge_types::{
    CodecId, DecodePhase, EncodeMode, FadeMode, OutputPhase, PcmFraming, SampleFormat,
    StatusEvent, StatusSnapshot, StreamPhase, TrackMetadata,
};

use crate::buffer::RingBuffer;
use crate::codec;
use crate::decode::{DecodeStage, OutputSink};
use crate::error::{PipelineError, Result};
use crate::output::fade::FIXED_ONE;
use crate::output::{OutputServer, OutputShared, TRANSFER_BUFFER_SIZE};
use crate::stream::{StreamEvent, StreamSource, StreamStage};
use crate::wake::Wake;

/// Input ring default: a couple of seconds of compressed audio.
pub const STREAMBUF_SIZE: usize = 2 * 1024 * 1024;
/// Output ring default: roughly twelve seconds of 44.1 kHz stereo 32-bit.
pub const OUTPUTBUF_SIZE: usize = 8 * 1024 * 1024;
/// Shrunken output ring while the player sits idle.
pub const OUTPUTBUF_IDLE_SIZE: usize = 256 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub streambuf_size: usize,
    pub outputbuf_size: usize,
    pub transfer_size: usize,
    /// Renderer-supported output rates; empty accepts anything.
    pub supported_rates: Vec<u32>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Idle time before render resources are released.
    pub idle_release: Duration,
    /// Listener bind address, port 0 for ephemeral.
    pub bind: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            streambuf_size: STREAMBUF_SIZE,
            outputbuf_size: OUTPUTBUF_SIZE,
            transfer_size: TRANSFER_BUFFER_SIZE,
            supported_rates: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(15),
            idle_release: Duration::from_secs(60),
            bind: "0.0.0.0:0".to_owned(),
        }
    }
}

/// Everything the session layer announces about one track.
#[derive(Clone, Debug)]
pub struct StreamDescriptor {
    pub source: StreamSource,
    pub codec: CodecId,
    pub format: SampleFormat,
    pub encode_mode: EncodeMode,
    pub framing: PcmFraming,
    /// Prebuffer bytes before decode starts.
    pub threshold: usize,
    /// Treat a premature server close as a pending track boundary.
    pub cont_wait: bool,
    /// ICY interval offered to the renderer; 0 disables metadata.
    pub icy_interval: usize,
    pub metadata: TrackMetadata,
}

pub struct PipelineContext {
    streambuf: Arc<RingBuffer>,
    outputbuf: Arc<RingBuffer>,
    output: Arc<OutputShared>,
    stream: Mutex<StreamStage>,
    decode: Mutex<DecodeUnit>,
    stream_wake: Wake,
    decode_wake: Wake,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    server: Mutex<Option<OutputServer>>,
    last_active: Mutex<Instant>,
    config: PipelineConfig,
}

struct DecodeUnit {
    stage: DecodeStage,
    sink: OutputSink,
    /// Rate last pushed into output control, to detect announcements.
    published_rate: u32,
}

impl PipelineContext {
    /// Build a player, start its renderer listener and stage threads, and
    /// hand back the status event stream.
    pub fn start(config: PipelineConfig) -> Result<(Arc<Self>, Receiver<StatusEvent>)> {
        let (tx, rx) = unbounded();
        let ctx = Self::start_with_events(config, tx)?;
        Ok((ctx, rx))
    }

    pub fn start_with_events(
        config: PipelineConfig,
        events: Sender<StatusEvent>,
    ) -> Result<Arc<Self>> {
        let streambuf = Arc::new(RingBuffer::new(config.streambuf_size));
        let outputbuf = Arc::new(RingBuffer::new(config.outputbuf_size));
        let output = Arc::new(OutputShared::new(Arc::clone(&outputbuf), events));
        output.with_control(|c| c.transfer_capacity = config.transfer_size);
        let server = OutputServer::start(Arc::clone(&output), &config.bind)?;

        let ctx = Arc::new(Self {
            streambuf,
            outputbuf: Arc::clone(&outputbuf),
            output,
            stream: Mutex::new(StreamStage::new(config.read_timeout)),
            decode: Mutex::new(DecodeUnit {
                stage: DecodeStage::new(),
                sink: OutputSink::new(outputbuf, config.supported_rates.clone()),
                published_rate: 0,
            }),
            stream_wake: Wake::new(),
            decode_wake: Wake::new(),
            running: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
            server: Mutex::new(Some(server)),
            last_active: Mutex::new(Instant::now()),
            config,
        });

        let mut threads = Vec::new();
        let stream_ctx = Arc::clone(&ctx);
        threads.push(
            std::thread::Builder::new()
                .name("pipeline-stream".into())
                .spawn(move || stream_ctx.stream_loop())
                .map_err(PipelineError::Io)?,
        );
        let decode_ctx = Arc::clone(&ctx);
        threads.push(
            std::thread::Builder::new()
                .name("pipeline-decode".into())
                .spawn(move || decode_ctx.decode_loop())
                .map_err(PipelineError::Io)?,
        );
        *ctx.threads.lock().unwrap() = threads;
        Ok(ctx)
    }

    /// Port the renderer should fetch audio from.
    pub fn port(&self) -> u16 {
        self.server
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.port())
            .unwrap_or(0)
    }

    /// Announce a new track. Fails with `Busy` while a previous stream is
    /// still being received; a finished stream (gapless boundary) is fine.
    pub fn open_stream(&self, desc: StreamDescriptor) -> Result<()> {
        if !codec::supports(desc.codec) {
            return Err(PipelineError::UnsupportedCodec(desc.codec));
        }
        let mut stream = self.stream.lock().unwrap();
        let receiving = matches!(
            stream.phase(),
            StreamPhase::WaitingForConnection
                | StreamPhase::SendingHeaders
                | StreamPhase::ReceivingHeaders
                | StreamPhase::Buffering
                | StreamPhase::StreamingHttp
                | StreamPhase::StreamingFile
        );
        if receiving && !stream.ended() {
            return Err(PipelineError::Busy);
        }

        let mut decode = self.decode.lock().unwrap();
        let old_tail = self.outputbuf.used();
        if old_tail == 0 {
            // Quiesced boundary: reclaim everything, restore full capacity.
            self.streambuf.flush();
            if self.outputbuf.capacity() != self.config.outputbuf_size {
                self.outputbuf.resize(self.config.outputbuf_size);
            } else {
                self.outputbuf.flush();
            }
            decode.sink.reset();
            decode.published_rate = 0;
        } else {
            self.streambuf.flush();
        }

        let total_bytes = match &desc.source {
            StreamSource::File(path) => std::fs::metadata(path).ok().map(|m| m.len()),
            StreamSource::Http(_) => None,
        };
        decode
            .stage
            .new_stream(desc.codec, desc.encode_mode, desc.format, total_bytes)?;
        stream.open(
            &desc.source,
            desc.threshold,
            desc.cont_wait,
            self.config.connect_timeout,
        )?;
        drop(decode);
        drop(stream);

        self.output.with_control(|c| {
            c.codec = desc.codec;
            c.encode_mode = desc.encode_mode;
            c.framing = desc.framing;
            c.icy_interval = desc.icy_interval;
            c.metadata = desc.metadata.clone();
            c.duration_frames = None;
            if c.phase == OutputPhase::Off || c.phase == OutputPhase::Stopped {
                c.phase = OutputPhase::Waiting;
            }
            c.start_track(old_tail);
        });
        *self.last_active.lock().unwrap() = Instant::now();
        self.stream_wake.signal();
        self.decode_wake.signal();
        tracing::info!(codec = %desc.codec.as_char(), old_tail, "stream opened");
        Ok(())
    }

    /// Stop everything for this player; buffers are reclaimed and serving
    /// connections end after their transfer tails.
    pub fn request_stop(&self) {
        self.stream.lock().unwrap().close();
        {
            let mut decode = self.decode.lock().unwrap();
            decode.stage.flush();
            decode.sink.reset();
        }
        self.output.with_control(|c| {
            c.stop_requested = true;
            c.fade.reset();
            c.phase = OutputPhase::Stopped;
        });
        self.streambuf.flush();
        self.outputbuf.flush();
        self.wake_all();
        tracing::info!("stop requested");
    }

    /// Discard buffered audio without tearing the player down (seek).
    pub fn request_flush(&self) {
        let mut decode = self.decode.lock().unwrap();
        decode.stage.flush();
        decode.sink.reset();
        drop(decode);
        self.streambuf.flush();
        self.outputbuf.flush();
        self.output.with_control(|c| c.fade.reset());
        self.wake_all();
        tracing::debug!("buffers flushed");
    }

    pub fn set_fade(&self, mode: FadeMode, duration_ms: u32) {
        self.output.with_control(|c| c.fade.configure(mode, duration_ms));
    }

    /// Volume as a linear factor; 1.0 is unity.
    pub fn set_volume(&self, gain: f64) {
        let fixed = (gain.clamp(0.0, 16.0) * FIXED_ONE as f64) as u32;
        self.output.with_control(|c| c.gain = fixed);
    }

    pub fn set_replay_gain(&self, gain: f64) {
        let fixed = (gain.clamp(0.0, 16.0) * FIXED_ONE as f64) as u32;
        self.output.with_control(|c| c.replay_gain = fixed);
    }

    /// Replay gain for the next announced track, applied at the boundary.
    pub fn set_next_replay_gain(&self, gain: f64) {
        let fixed = (gain.clamp(0.0, 16.0) * FIXED_ONE as f64) as u32;
        self.output.with_control(|c| c.next_replay_gain = Some(fixed));
    }

    /// Continuous-stream mode: the renderer connection is reused across
    /// track boundaries instead of the Running/Draining hand-off.
    pub fn set_flow(&self, flow: bool) {
        self.output.with_control(|c| c.flow = flow);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (stream_phase, bytes_received) = {
            let s = self.stream.lock().unwrap();
            (s.phase(), s.bytes_received())
        };
        let decode_phase = self.decode.lock().unwrap().stage.phase();
        self.output.with_control(|c| StatusSnapshot {
            stream_phase,
            decode_phase,
            output_phase: c.phase,
            stream_full: self.streambuf.used(),
            stream_size: self.streambuf.capacity(),
            bytes_received,
            output_full: self.outputbuf.used(),
            output_size: self.outputbuf.capacity(),
            sample_rate: c.rate,
            ms_played: if c.rate > 0 {
                c.frames_played * 1000 / c.rate as u64
            } else {
                0
            },
            duration_ms: c.metadata.duration_ms,
            output_ready: c.running_active || c.draining_active,
        })
    }

    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.request_stop();
        self.wake_all();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
        if let Some(mut server) = self.server.lock().unwrap().take() {
            server.stop();
        }
        tracing::info!("pipeline shut down");
    }

    fn wake_all(&self) {
        self.stream_wake.signal();
        self.decode_wake.signal();
        self.output.wake.signal();
    }

    fn stream_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let (progress, events) = {
                let mut stream = self.stream.lock().unwrap();
                let progress = stream.run_once(&self.streambuf);
                let mut events = Vec::new();
                while let Some(ev) = stream.take_event() {
                    events.push(ev);
                }
                (progress, events)
            };
            for ev in events {
                self.on_stream_event(ev);
            }
            if progress {
                *self.last_active.lock().unwrap() = Instant::now();
                self.decode_wake.signal();
            } else {
                self.maybe_release_idle();
                self.stream_wake.wait_timeout(POLL_INTERVAL);
            }
        }
    }

    fn on_stream_event(&self, ev: StreamEvent) {
        match ev {
            StreamEvent::HeadersReceived => {}
            StreamEvent::EndOfStream | StreamEvent::TrackBoundary => {
                // Decode picks the tail up via `ended()`; just nudge it.
                self.decode_wake.signal();
            }
            StreamEvent::Disconnected(code) => {
                self.output.emit(StatusEvent::Disconnected { code });
                self.decode_wake.signal();
            }
            StreamEvent::MetadataTitle(title) => {
                self.output.with_control(|c| {
                    c.metadata.title = Some(title);
                    c.metadata.artist = None;
                });
            }
        }
    }

    fn decode_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            // Hold decode back while the stream stage is still prebuffering.
            let (buffering, stream_ended) = {
                let stream = self.stream.lock().unwrap();
                (stream.phase() == StreamPhase::Buffering, stream.ended())
            };
            let mut unit = self.decode.lock().unwrap();
            let before = unit.stage.phase();
            let progress = if buffering {
                false
            } else {
                let DecodeUnit { stage, sink, .. } = &mut *unit;
                stage.run_once(&self.streambuf, sink, stream_ended)
            };
            let after = unit.stage.phase();
            let rate = unit.sink.out_rate();
            let publish_rate = rate > 0 && rate != unit.published_rate;
            if publish_rate {
                unit.published_rate = rate;
                self.output.with_control(|c| {
                    c.rate = rate;
                    c.duration_frames = c
                        .metadata
                        .duration_ms
                        .map(|ms| ms * rate as u64 / 1000);
                });
            }
            // Mirror phase transitions before releasing the unit lock:
            // `open_stream` re-arms the stage under the same lock, so a
            // stale completion can never land on the next track's flags.
            if after != before {
                match after {
                    DecodePhase::Complete => {
                        self.output.with_control(|c| c.decode_complete = true);
                    }
                    DecodePhase::Error => {
                        self.output.with_control(|c| c.decode_failed = true);
                        self.output.emit(StatusEvent::DecodeError);
                    }
                    _ => {}
                }
            }
            drop(unit);
            if progress {
                *self.last_active.lock().unwrap() = Instant::now();
                // Output may have samples now, stream may have space.
                self.output.wake.signal();
                self.stream_wake.signal();
            } else {
                self.decode_wake.wait_timeout(POLL_INTERVAL);
            }
        }
    }

    /// Shrink the output ring after a long idle stretch.
    fn maybe_release_idle(&self) {
        if self.outputbuf.capacity() == OUTPUTBUF_IDLE_SIZE.min(self.config.outputbuf_size) {
            return;
        }
        let idle_for = self.last_active.lock().unwrap().elapsed();
        if idle_for < self.config.idle_release {
            return;
        }
        let quiet = self.output.with_control(|c| {
            !c.running_active
                && !c.draining_active
                && matches!(c.phase, OutputPhase::Stopped | OutputPhase::Waiting | OutputPhase::Off)
        }) && self.decode.lock().unwrap().stage.phase() == DecodePhase::Stopped
            && self.outputbuf.used() == 0;
        if quiet {
            self.outputbuf
                .resize(OUTPUTBUF_IDLE_SIZE.min(self.config.outputbuf_size));
            tracing::debug!("idle output buffer released");
        }
    }
}

impl Drop for PipelineContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn write_temp_pcm(frames: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "pipeline-ctx-{}-{frames}.raw",
            std::process::id()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..frames as i64 {
            let s = ((i % 3000) - 1500) as i16;
            f.write_all(&s.to_le_bytes()).unwrap();
            f.write_all(&s.to_le_bytes()).unwrap();
        }
        path
    }

    fn descriptor(path: PathBuf) -> StreamDescriptor {
        StreamDescriptor {
            source: StreamSource::File(path),
            codec: CodecId::Pcm,
            format: SampleFormat::default(),
            encode_mode: EncodeMode::Pcm,
            framing: PcmFraming::Wav,
            threshold: 0,
            cont_wait: false,
            icy_interval: 0,
            metadata: TrackMetadata::default(),
        }
    }

    #[test]
    fn open_while_receiving_is_busy() {
        // Larger than the input ring plus what decode can move into the
        // output ring, so the stream stage stays busy with no consumer.
        let path = write_temp_pcm(1_700_000);
        let (ctx, _events) = PipelineContext::start(PipelineConfig {
            bind: "127.0.0.1:0".into(),
            ..PipelineConfig::default()
        })
        .unwrap();
        ctx.open_stream(descriptor(path.clone())).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let err = ctx.open_stream(descriptor(path.clone())).unwrap_err();
        assert!(matches!(err, PipelineError::Busy));
        ctx.shutdown();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn snapshot_reports_progress() {
        let path = write_temp_pcm(5000);
        let (ctx, _events) = PipelineContext::start(PipelineConfig {
            bind: "127.0.0.1:0".into(),
            ..PipelineConfig::default()
        })
        .unwrap();
        assert!(ctx.port() > 0);
        ctx.open_stream(descriptor(path.clone())).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snap = ctx.snapshot();
            if snap.decode_phase == DecodePhase::Complete {
                assert_eq!(snap.sample_rate, 44_100);
                assert_eq!(snap.bytes_received, 5000 * 4);
                assert!(snap.output_full > 0);
                break;
            }
            assert!(Instant::now() < deadline, "decode never completed");
            std::thread::sleep(Duration::from_millis(10));
        }
        ctx.shutdown();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stop_resets_buffers() {
        let path = write_temp_pcm(5000);
        let (ctx, _events) = PipelineContext::start(PipelineConfig {
            bind: "127.0.0.1:0".into(),
            ..PipelineConfig::default()
        })
        .unwrap();
        ctx.open_stream(descriptor(path.clone())).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        ctx.request_stop();
        assert_eq!(ctx.snapshot().stream_full, 0);
        assert_eq!(ctx.snapshot().output_full, 0);
        ctx.shutdown();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unsupported_rate_is_resampled_per_config() {
        let path = write_temp_pcm(2000);
        let (ctx, _events) = PipelineContext::start(PipelineConfig {
            bind: "127.0.0.1:0".into(),
            supported_rates: vec![48_000],
            ..PipelineConfig::default()
        })
        .unwrap();
        ctx.open_stream(descriptor(path.clone())).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while ctx.snapshot().decode_phase != DecodePhase::Complete {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ctx.snapshot().sample_rate, 48_000);
        ctx.shutdown();
        let _ = std::fs::remove_file(&path);
    }
}
