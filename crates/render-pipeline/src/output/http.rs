//! Renderer-facing HTTP server and the per-connection stream bodies.
//!
//! Each accepted GET gets its own thread (tiny_http hands the request off
//! and the response body streams from a `TrackBody`). The body starts in
//! the Running role: the sole consumer of the shared output ring. When the
//! ring is drained and decode is complete it hands the role back, emits
//! `track_complete`, and keeps serving its transfer-buffer tail in the
//! Draining role so the next track's connection can start pulling
//! immediately.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use render_bridge_types::{EncodeMode, OutputPhase, StatusEvent};
use tiny_http::{Header, Method, Response, Server, StatusCode};

use crate::buffer::BYTES_PER_FRAME;
use crate::error::{PipelineError, Result};
use crate::output::OutputShared;
use crate::output::encode::Encoder;
use crate::output::fade::apply_gain_samples;
use crate::output::icy::IcyInjector;

const PULL_CHUNK_FRAMES: usize = 4096;
const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Running,
    Draining,
}

enum TopUp {
    Progress,
    Idle,
    Eof,
}

/// Streaming response body for one renderer connection.
struct TrackBody {
    shared: Arc<OutputShared>,
    role: Role,
    transfer: VecDeque<u8>,
    encoder: Encoder,
    icy: Option<IcyInjector>,
    header_sent: bool,
    released: bool,
    track_index: u16,
    /// Frames this connection has served, for position reporting.
    served_frames: u64,
    next_position_at: u64,
}

impl TrackBody {
    fn new(shared: Arc<OutputShared>, encoder: Encoder, icy: Option<IcyInjector>, track_index: u16) -> Self {
        Self {
            shared,
            role: Role::Running,
            transfer: VecDeque::new(),
            encoder,
            icy,
            header_sent: false,
            released: false,
            track_index,
            served_frames: 0,
            next_position_at: 0,
        }
    }

    fn push_payload(&mut self, bytes: &[u8]) {
        match self.icy.as_mut() {
            Some(icy) => {
                let mut framed = Vec::with_capacity(bytes.len() + 64);
                icy.process(bytes, &mut framed);
                self.transfer.extend(framed);
            }
            None => self.transfer.extend(bytes),
        }
    }

    /// Pull from the ring into the transfer buffer; Running role only.
    fn top_up(&mut self) -> TopUp {
        let shared = Arc::clone(&self.shared);
        let mut control = shared.control.lock().unwrap();

        if control.stop_requested {
            self.transfer.clear();
            return TopUp::Eof;
        }
        if !self.header_sent {
            if control.rate == 0 && self.encoder.mode() != EncodeMode::Thru {
                // Format not known yet; decode has not announced a rate.
                return TopUp::Idle;
            }
            self.encoder.start_track(control.rate);
            let header = self.encoder.header(control.duration_frames);
            if !header.is_empty() {
                self.push_payload(&header);
            }
            self.header_sent = true;
        }

        let room = control.transfer_capacity.saturating_sub(self.transfer.len());
        let mut progressed = false;

        if self.encoder.mode() == EncodeMode::Thru {
            let n = room.min(shared.outputbuf.used()).min(16 * 1024);
            if n > 0 {
                let mut chunk = vec![0u8; n];
                let got = shared.outputbuf.read(&mut chunk);
                chunk.truncate(got);
                self.push_payload(&chunk);
                progressed = got > 0;
            }
        } else {
            let bpf = self.encoder.bytes_per_frame().max(1);
            let want_frames = (room / bpf).min(PULL_CHUNK_FRAMES);
            // Arm a pending fade-out once the end of track is in sight.
            if control.decode_complete {
                let remaining = shared.outputbuf.used() / BYTES_PER_FRAME;
                let rate = control.rate;
                control.fade.start_out(remaining, rate);
            }
            if want_frames > 0 {
                let mut samples = Vec::with_capacity(want_frames * 2);
                let incoming_ready = control.decode_complete || control.decode_failed;
                let n = control.fade.pull_frames(
                    &shared.outputbuf,
                    want_frames,
                    incoming_ready,
                    &mut samples,
                );
                if n > 0 {
                    apply_gain_samples(&mut samples, control.effective_gain());
                    let mut bytes = Vec::new();
                    self.encoder.encode(&samples, &mut bytes);
                    self.push_payload(&bytes);
                    control.frames_played += n as u64;
                    progressed = true;
                }
            }
        }

        if progressed && !control.started_emitted {
            control.started_emitted = true;
            let index = control.track_index;
            drop(control);
            shared.emit(StatusEvent::TrackStarted { index });
            shared.wake.signal();
            return TopUp::Progress;
        }

        // Running -> Draining hand-off at the track boundary.
        let track_done = control.decode_complete || control.decode_failed;
        if shared.outputbuf.used() == 0 && track_done {
            if !control.complete_emitted {
                control.complete_emitted = true;
                if control.decode_failed && !control.decode_complete {
                    // Already surfaced as a decode error; a completion here
                    // would make the failure look like a finished track.
                    tracing::debug!(track = self.track_index, "track ended by decode failure");
                } else {
                    let index = control.track_index;
                    drop(control);
                    shared.emit(StatusEvent::TrackComplete { index });
                    shared.wake.signal();
                    return TopUp::Progress;
                }
            }
            if !control.flow && !control.draining_active {
                control.running_active = false;
                control.draining_active = true;
                self.role = Role::Draining;
                tracing::debug!(track = self.track_index, "output role running -> draining");
                drop(control);
                shared.wake.signal();
                return TopUp::Progress;
            }
            if control.flow && self.transfer.is_empty() {
                // Continuous stream: park until the next track's samples land.
                return TopUp::Idle;
            }
        }

        if progressed { TopUp::Progress } else { TopUp::Idle }
    }

    fn note_served(&mut self, bytes: usize) {
        let bpf = self.encoder.bytes_per_frame();
        if bpf == 0 {
            return;
        }
        self.served_frames += (bytes / bpf) as u64;
        let (rate, played) = self
            .shared
            .with_control(|c| (c.rate, c.frames_played));
        if rate > 0 && self.served_frames >= self.next_position_at {
            self.next_position_at = self.served_frames + rate as u64;
            let ms_played = played * 1000 / rate as u64;
            self.shared.emit(StatusEvent::PositionUpdate { ms_played });
        }
    }

    fn release(&mut self, clean: bool) {
        if self.released {
            return;
        }
        self.released = true;
        let role = self.role;
        let unserved = self.transfer.len();
        self.shared.with_control(|c| {
            match role {
                Role::Running => c.running_active = false,
                Role::Draining => c.draining_active = false,
            }
            if !c.running_active && !c.draining_active {
                c.phase = OutputPhase::Waiting;
            }
            if !clean && !c.stop_requested && role == Role::Running {
                tracing::info!(unserved, "renderer dropped connection");
            }
        });
        if !clean {
            self.shared.emit(StatusEvent::PlaybackStopped);
        }
    }
}

impl Read for TrackBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            // Run ahead of the renderer: keep pulling until the transfer
            // buffer is full (capacity bounds the run-ahead) or the ring has
            // nothing more right now. The hand-off may flip the role mid-loop.
            while self.role == Role::Running {
                match self.top_up() {
                    TopUp::Progress => {}
                    TopUp::Idle => break,
                    TopUp::Eof => {
                        self.release(true);
                        return Ok(0);
                    }
                }
            }
            if !self.transfer.is_empty() {
                break;
            }
            match self.role {
                Role::Draining => {
                    self.release(true);
                    return Ok(0);
                }
                Role::Running => {
                    self.shared.wake.wait_timeout(IDLE_WAIT);
                }
            }
        }
        let n = buf.len().min(self.transfer.len());
        for (i, b) in self.transfer.drain(..n).enumerate() {
            buf[i] = b;
        }
        self.note_served(n);
        Ok(n)
    }
}

impl Drop for TrackBody {
    fn drop(&mut self) {
        // Reached without EOF only when the renderer hung up.
        self.release(false);
    }
}

/// Per-player HTTP listener.
pub struct OutputServer {
    server: Arc<Server>,
    port: u16,
    shutdown: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl OutputServer {
    pub fn start(shared: Arc<OutputShared>, bind: &str) -> Result<Self> {
        let server =
            Arc::new(Server::http(bind).map_err(|e| PipelineError::Listener(e.to_string()))?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .ok_or_else(|| PipelineError::Listener("no tcp listen address".into()))?;
        tracing::info!(port, "output listener started");

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_server = Arc::clone(&server);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept = std::thread::Builder::new()
            .name("output-accept".into())
            .spawn(move || {
                for request in accept_server.incoming_requests() {
                    if accept_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let shared = Arc::clone(&shared);
                    let spawned = std::thread::Builder::new()
                        .name("output-stream".into())
                        .spawn(move || handle_request(shared, request));
                    if let Err(err) = spawned {
                        tracing::error!(error = %err, "output thread spawn failed");
                    }
                }
            })
            .map_err(|e| PipelineError::Listener(e.to_string()))?;

        Ok(Self {
            server,
            port,
            shutdown,
            accept: Some(accept),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.server.unblock();
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OutputServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn handle_request(shared: Arc<OutputShared>, request: tiny_http::Request) {
    let method = request.method().clone();
    if method != Method::Get && method != Method::Head {
        let _ = request.respond(Response::from_string("method not allowed").with_status_code(405));
        return;
    }
    let wants_icy = request
        .headers()
        .iter()
        .any(|h| h.field.equiv("icy-metadata") && h.value.as_str().trim() == "1");
    tracing::debug!(method = %method, url = request.url(), wants_icy, "renderer request");

    // Snapshot format parameters and, for GET, claim the Running role.
    let (accepted, mime, icy_interval, encoder, track_index) = shared.with_control(|c| {
        let encoder = Encoder::new(c.encode_mode, c.framing, c.sample_bits);
        let mut probe = Encoder::new(c.encode_mode, c.framing, c.sample_bits);
        probe.start_track(if c.rate > 0 { c.rate } else { 44_100 });
        let mime = probe.mime(c.codec);
        let icy_interval = if wants_icy { c.icy_interval } else { 0 };
        if method == Method::Get {
            if c.running_active {
                return (false, mime, icy_interval, encoder, c.track_index);
            }
            c.running_active = true;
            c.phase = OutputPhase::Running;
        }
        (true, mime, icy_interval, encoder, c.track_index)
    });

    if !accepted {
        // Only one connection may drain the shared ring.
        let _ = request.respond(Response::from_string("stream busy").with_status_code(503));
        return;
    }

    let mut headers: Vec<Header> = Vec::new();
    if let Some(h) = header("Content-Type", &mime) {
        headers.push(h);
    }
    if icy_interval > 0 {
        if let Some(h) = header("icy-metaint", &icy_interval.to_string()) {
            headers.push(h);
        }
    }
    if let Some(h) = header("Accept-Ranges", "none") {
        headers.push(h);
    }

    if method == Method::Head {
        let mut response = Response::empty(StatusCode(200));
        for h in headers {
            response = response.with_header(h);
        }
        let _ = request.respond(response);
        return;
    }

    let icy = (icy_interval > 0).then(|| {
        let mut injector = IcyInjector::new(icy_interval);
        let metadata = shared.with_control(|c| c.metadata.clone());
        injector.set_metadata(&metadata);
        injector
    });
    let body = TrackBody::new(Arc::clone(&shared), encoder, icy, track_index);
    let response = Response::new(StatusCode(200), headers, body, None, None);
    if let Err(err) = request.respond(response) {
        tracing::debug!(error = %err, "renderer connection ended with error");
    }
}
