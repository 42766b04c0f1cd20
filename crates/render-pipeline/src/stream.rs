//! Stream stage: fills the input ring buffer from an HTTP source or a
//! local file.
//!
//! The stage is a non-blocking poll step driven by the stream thread. HTTP
//! sources walk `SendingHeaders -> ReceivingHeaders -> Buffering ->
//! StreamingHttp`; file sources go straight to `StreamingFile`. End-of-source
//! classification is the subtle part: a clean end (length satisfied, or no
//! announced length), a deferred track boundary (`cont_wait`) and a genuine
//! remote drop all look like EOF on the socket and must be told apart here.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use render_bridge_types::{DisconnectCode, StreamPhase};

use crate::buffer::RingBuffer;
use crate::error::{PipelineError, Result};

const HEADER_LIMIT: usize = 8192;
const READ_CHUNK: usize = 4096;

/// Where the bytes come from.
#[derive(Clone, Debug)]
pub enum StreamSource {
    Http(HttpSource),
    File(PathBuf),
}

/// An HTTP source with a pre-built request header block, the way the
/// session layer hands it down (it negotiates range and ICY headers itself).
#[derive(Clone, Debug)]
pub struct HttpSource {
    pub host: String,
    pub port: u16,
    /// Full request header block, terminated by an empty line.
    pub request: String,
}

impl HttpSource {
    /// Plain GET with ICY metadata requested.
    pub fn get(host: &str, port: u16, path: &str, want_icy: bool) -> Self {
        let icy = if want_icy { "Icy-MetaData: 1\r\n" } else { "" };
        Self {
            host: host.to_owned(),
            port,
            request: format!(
                "GET {path} HTTP/1.0\r\nHost: {host}:{port}\r\nAccept: */*\r\n{icy}\r\n"
            ),
        }
    }
}

/// Parsed response headers, surfaced for session-layer inspection.
#[derive(Clone, Debug, Default)]
pub struct ResponseHeaders {
    pub status: u16,
    pub content_length: Option<u64>,
    pub icy_metaint: Option<usize>,
    pub raw: String,
}

/// Events the context forwards upward or reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    HeadersReceived,
    /// Source delivered everything it promised (or had no promise to break).
    EndOfStream,
    /// Premature close with `cont_wait` set: the session layer decides
    /// whether to reconnect for gapless continuation.
    TrackBoundary,
    Disconnected(DisconnectCode),
    /// In-band ICY title update, stripped from the audio bytes.
    MetadataTitle(String),
}

enum Conn {
    Tcp(TcpStream),
    File(File),
}

#[derive(Default)]
struct IcyStrip {
    interval: usize,
    /// Audio bytes until the next metadata block.
    remain: usize,
    /// Metadata bytes still expected; 0 means the next byte is a length byte
    /// (only meaningful while `in_meta`).
    meta_left: usize,
    in_meta: bool,
    meta_buf: Vec<u8>,
}

impl IcyStrip {
    fn new(interval: usize) -> Self {
        Self {
            interval,
            remain: interval,
            ..Self::default()
        }
    }

    /// Split `input` into audio (appended to `out`) and metadata; returns a
    /// title if a complete metadata block with one was seen.
    fn strip(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Option<String> {
        let mut title = None;
        while !input.is_empty() {
            if !self.in_meta && self.remain > 0 {
                let n = self.remain.min(input.len());
                out.extend_from_slice(&input[..n]);
                self.remain -= n;
                input = &input[n..];
                continue;
            }
            if !self.in_meta {
                // Length byte counts 16-byte units.
                self.meta_left = input[0] as usize * 16;
                input = &input[1..];
                self.in_meta = true;
                self.meta_buf.clear();
                if self.meta_left == 0 {
                    self.in_meta = false;
                    self.remain = self.interval;
                }
                continue;
            }
            let n = self.meta_left.min(input.len());
            self.meta_buf.extend_from_slice(&input[..n]);
            self.meta_left -= n;
            input = &input[n..];
            if self.meta_left == 0 {
                self.in_meta = false;
                self.remain = self.interval;
                if let Some(t) = parse_stream_title(&self.meta_buf) {
                    title = Some(t);
                }
            }
        }
        title
    }
}

fn parse_stream_title(meta: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(meta);
    let start = text.find("StreamTitle='")? + "StreamTitle='".len();
    let end = text[start..].find("';")? + start;
    Some(text[start..end].to_owned())
}

pub struct StreamStage {
    phase: StreamPhase,
    conn: Option<Conn>,
    header_out: Vec<u8>,
    header_sent: usize,
    header_in: Vec<u8>,
    headers: Option<ResponseHeaders>,
    icy: Option<IcyStrip>,
    threshold: usize,
    cont_wait: bool,
    bytes_received: u64,
    disconnect: DisconnectCode,
    ended: bool,
    last_read: Instant,
    read_timeout: Duration,
    events: VecDeque<StreamEvent>,
}

impl StreamStage {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            phase: StreamPhase::Stopped,
            conn: None,
            header_out: Vec::new(),
            header_sent: 0,
            header_in: Vec::new(),
            headers: None,
            icy: None,
            threshold: 0,
            cont_wait: false,
            bytes_received: 0,
            disconnect: DisconnectCode::Ok,
            ended: false,
            last_read: Instant::now(),
            read_timeout,
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// True once the source is done delivering; decode drains what remains.
    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn disconnect_code(&self) -> DisconnectCode {
        self.disconnect
    }

    pub fn headers(&self) -> Option<&ResponseHeaders> {
        self.headers.as_ref()
    }

    pub fn take_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    /// Connect to the source and start the header exchange (HTTP) or open
    /// the file. `threshold` bytes must accumulate before the stage promotes
    /// to `StreamingHttp` and decode is unleashed.
    pub fn open(
        &mut self,
        source: &StreamSource,
        threshold: usize,
        cont_wait: bool,
        connect_timeout: Duration,
    ) -> Result<()> {
        self.reset();
        self.threshold = threshold;
        self.cont_wait = cont_wait;
        match source {
            StreamSource::Http(http) => {
                self.phase = StreamPhase::WaitingForConnection;
                let addr = (http.host.as_str(), http.port)
                    .to_socket_addrs()
                    .map_err(|e| PipelineError::Unreachable(e.to_string()))?
                    .next()
                    .ok_or_else(|| {
                        PipelineError::Unreachable(format!("{}:{}", http.host, http.port))
                    })?;
                let sock = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| {
                    self.phase = StreamPhase::Disconnected;
                    self.disconnect = DisconnectCode::Unreachable;
                    if e.kind() == std::io::ErrorKind::TimedOut {
                        PipelineError::ConnectTimeout(connect_timeout.as_millis() as u64)
                    } else {
                        PipelineError::Unreachable(e.to_string())
                    }
                })?;
                sock.set_nonblocking(true)?;
                tracing::info!(host = %http.host, port = http.port, "source connected");
                self.conn = Some(Conn::Tcp(sock));
                self.header_out = http.request.clone().into_bytes();
                self.phase = StreamPhase::SendingHeaders;
            }
            StreamSource::File(path) => {
                let file = File::open(path)?;
                let len = file.metadata().ok().map(|m| m.len());
                tracing::info!(path = %path.display(), len, "file source opened");
                self.headers = Some(ResponseHeaders {
                    status: 200,
                    content_length: len,
                    ..ResponseHeaders::default()
                });
                self.conn = Some(Conn::File(file));
                self.phase = StreamPhase::StreamingFile;
            }
        }
        self.last_read = Instant::now();
        Ok(())
    }

    /// One non-blocking step. Returns true when bytes moved or the phase
    /// advanced, so the stream thread knows whether to keep spinning or park.
    pub fn run_once(&mut self, streambuf: &RingBuffer) -> bool {
        match self.phase {
            StreamPhase::SendingHeaders => self.step_send_headers(),
            StreamPhase::ReceivingHeaders => self.step_recv_headers(),
            StreamPhase::Buffering | StreamPhase::StreamingHttp => self.step_body(streambuf),
            StreamPhase::StreamingFile => self.step_file(streambuf),
            _ => false,
        }
    }

    /// Local close; never reported as an error.
    pub fn close(&mut self) {
        if self.conn.is_some() {
            tracing::debug!(bytes = self.bytes_received, "stream closed locally");
        }
        self.reset();
        self.disconnect = DisconnectCode::LocalDisconnect;
    }

    fn reset(&mut self) {
        self.phase = StreamPhase::Stopped;
        self.conn = None;
        self.header_out.clear();
        self.header_sent = 0;
        self.header_in.clear();
        self.headers = None;
        self.icy = None;
        self.bytes_received = 0;
        self.disconnect = DisconnectCode::Ok;
        self.ended = false;
        self.events.clear();
    }

    fn fail(&mut self, code: DisconnectCode) {
        tracing::warn!(?code, bytes = self.bytes_received, "stream disconnected");
        self.phase = StreamPhase::Disconnected;
        self.disconnect = code;
        self.conn = None;
        self.events.push_back(StreamEvent::Disconnected(code));
    }

    fn sock(&mut self) -> Option<&mut TcpStream> {
        match self.conn.as_mut() {
            Some(Conn::Tcp(s)) => Some(s),
            _ => None,
        }
    }

    fn step_send_headers(&mut self) -> bool {
        let sent = self.header_sent;
        let buf = std::mem::take(&mut self.header_out);
        let outcome = match self.sock() {
            Some(sock) => sock.write(&buf[sent..]),
            None => return false,
        };
        self.header_out = buf;
        match outcome {
            Ok(n) => {
                self.header_sent += n;
                if self.header_sent == self.header_out.len() {
                    self.phase = StreamPhase::ReceivingHeaders;
                    self.last_read = Instant::now();
                }
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.check_timeout();
                false
            }
            Err(_) => {
                self.fail(DisconnectCode::RemoteDisconnect);
                true
            }
        }
    }

    fn step_recv_headers(&mut self) -> bool {
        // Byte-at-a-time scan for the blank line, so no body bytes are
        // swallowed into header scratch.
        let mut progressed = false;
        loop {
            let mut byte = [0u8; 1];
            let outcome = match self.sock() {
                Some(sock) => sock.read(&mut byte),
                None => return progressed,
            };
            match outcome {
                Ok(0) => {
                    self.fail(DisconnectCode::RemoteDisconnect);
                    return true;
                }
                Ok(_) => {
                    progressed = true;
                    self.last_read = Instant::now();
                    self.header_in.push(byte[0]);
                    if self.header_in.len() > HEADER_LIMIT {
                        self.fail(DisconnectCode::RemoteDisconnect);
                        return true;
                    }
                    if self.header_in.ends_with(b"\r\n\r\n") {
                        self.finish_headers();
                        return true;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.check_timeout();
                    return progressed;
                }
                Err(_) => {
                    self.fail(DisconnectCode::RemoteDisconnect);
                    return true;
                }
            }
        }
    }

    fn finish_headers(&mut self) {
        let raw = String::from_utf8_lossy(&self.header_in).into_owned();
        let mut parsed = ResponseHeaders {
            raw: raw.clone(),
            ..ResponseHeaders::default()
        };
        let mut lines = raw.split("\r\n");
        if let Some(status_line) = lines.next() {
            parsed.status = status_line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
        }
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                parsed.content_length = value.parse().ok();
            } else if name.eq_ignore_ascii_case("icy-metaint") {
                parsed.icy_metaint = value.parse().ok();
            }
        }
        tracing::debug!(
            status = parsed.status,
            content_length = parsed.content_length,
            icy_metaint = parsed.icy_metaint,
            "response headers received"
        );
        if let Some(interval) = parsed.icy_metaint.filter(|&i| i > 0) {
            self.icy = Some(IcyStrip::new(interval));
        }
        self.headers = Some(parsed);
        self.header_in.clear();
        self.phase = if self.threshold == 0 {
            StreamPhase::StreamingHttp
        } else {
            StreamPhase::Buffering
        };
        self.events.push_back(StreamEvent::HeadersReceived);
    }

    fn step_body(&mut self, streambuf: &RingBuffer) -> bool {
        if streambuf.space() == 0 {
            return false;
        }
        let outcome = if self.icy.is_some() {
            // Metadata has to be cut out, so read through scratch.
            let max = streambuf.space().min(READ_CHUNK);
            let mut scratch = vec![0u8; max];
            match self.sock() {
                Some(sock) => sock.read(&mut scratch).map(|n| {
                    scratch.truncate(n);
                    scratch
                }),
                None => return false,
            }
        } else {
            let max = streambuf.space().min(READ_CHUNK);
            match self.sock() {
                Some(sock) => {
                    match streambuf.fill_from(sock, max) {
                        Ok(n) => {
                            if n == 0 {
                                // EOF straight into the ring path.
                                self.on_eof();
                                return true;
                            }
                            self.bytes_received += n as u64;
                            self.last_read = Instant::now();
                            self.maybe_promote(streambuf);
                            return true;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            self.check_timeout();
                            return false;
                        }
                        Err(_) => {
                            self.fail(DisconnectCode::RemoteDisconnect);
                            return true;
                        }
                    }
                }
                None => return false,
            }
        };
        match outcome {
            Ok(raw) if raw.is_empty() => {
                self.on_eof();
                true
            }
            Ok(raw) => {
                self.bytes_received += raw.len() as u64;
                self.last_read = Instant::now();
                let mut audio = Vec::with_capacity(raw.len());
                let title = self
                    .icy
                    .as_mut()
                    .map(|s| s.strip(&raw, &mut audio))
                    .unwrap_or(None);
                streambuf.write(&audio);
                if let Some(title) = title {
                    self.events.push_back(StreamEvent::MetadataTitle(title));
                }
                self.maybe_promote(streambuf);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.check_timeout();
                false
            }
            Err(_) => {
                self.fail(DisconnectCode::RemoteDisconnect);
                true
            }
        }
    }

    fn step_file(&mut self, streambuf: &RingBuffer) -> bool {
        let Some(Conn::File(file)) = self.conn.as_mut() else {
            return false;
        };
        if streambuf.space() == 0 {
            return false;
        }
        match streambuf.fill_from(file, READ_CHUNK) {
            Ok(0) => {
                self.ended = true;
                self.disconnect = DisconnectCode::Ok;
                self.phase = StreamPhase::Disconnected;
                self.conn = None;
                self.events.push_back(StreamEvent::EndOfStream);
                tracing::debug!(bytes = self.bytes_received, "file source exhausted");
                true
            }
            Ok(n) => {
                self.bytes_received += n as u64;
                true
            }
            Err(_) => {
                self.fail(DisconnectCode::RemoteDisconnect);
                true
            }
        }
    }

    fn maybe_promote(&mut self, streambuf: &RingBuffer) {
        if self.phase == StreamPhase::Buffering && streambuf.used() >= self.threshold {
            tracing::debug!(buffered = streambuf.used(), "prebuffer threshold reached");
            self.phase = StreamPhase::StreamingHttp;
        }
    }

    /// Classify an EOF on the HTTP body.
    fn on_eof(&mut self) {
        let promised = self
            .headers
            .as_ref()
            .and_then(|h| h.content_length)
            .filter(|&l| l > 0);
        let satisfied = match promised {
            Some(len) => self.bytes_received >= len,
            // No announced length: any server close is a clean end.
            None => true,
        };
        self.conn = None;
        self.ended = true;
        if satisfied {
            self.disconnect = DisconnectCode::Ok;
            self.phase = StreamPhase::Disconnected;
            self.events.push_back(StreamEvent::EndOfStream);
        } else if self.cont_wait {
            // Track boundary pending; the session layer may reconnect.
            self.disconnect = DisconnectCode::Ok;
            self.phase = StreamPhase::Disconnected;
            self.events.push_back(StreamEvent::TrackBoundary);
        } else {
            self.fail(DisconnectCode::RemoteDisconnect);
        }
    }

    fn check_timeout(&mut self) {
        if self.last_read.elapsed() > self.read_timeout {
            self.fail(DisconnectCode::Timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn stage() -> StreamStage {
        StreamStage::new(Duration::from_secs(10))
    }

    fn drive(stage: &mut StreamStage, buf: &RingBuffer, max_steps: usize) {
        for _ in 0..max_steps {
            if !stage.run_once(buf) {
                std::thread::sleep(Duration::from_millis(2));
            }
            if stage.phase() == StreamPhase::Disconnected {
                break;
            }
        }
    }

    fn serve_once(response: Vec<u8>) -> (String, u16, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut discard = [0u8; 1024];
            let _ = sock.read(&mut discard); // request headers
            sock.write_all(&response).unwrap();
        });
        ("127.0.0.1".to_owned(), port, handle)
    }

    #[test]
    fn header_parse_extracts_length_and_metaint() {
        let mut s = stage();
        s.header_in = b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\nicy-metaint: 16000\r\n\r\n"
            .to_vec();
        s.finish_headers();
        let h = s.headers().unwrap();
        assert_eq!(h.status, 200);
        assert_eq!(h.content_length, Some(1234));
        assert_eq!(h.icy_metaint, Some(16000));
        assert_eq!(s.take_event(), Some(StreamEvent::HeadersReceived));
    }

    #[test]
    fn icy_strip_removes_metadata_and_reports_title() {
        let mut strip = IcyStrip::new(8);
        let mut stream = Vec::new();
        stream.extend_from_slice(b"AAAAAAAA"); // 8 audio bytes
        let meta = b"StreamTitle='Test Song';";
        let mut block = meta.to_vec();
        block.resize(meta.len().div_ceil(16) * 16, 0);
        stream.push((block.len() / 16) as u8);
        stream.extend_from_slice(&block);
        stream.extend_from_slice(b"BBBBBBBB");
        stream.push(0); // empty metadata block
        stream.extend_from_slice(b"CCCC");

        let mut audio = Vec::new();
        let title = strip.strip(&stream, &mut audio);
        assert_eq!(title.as_deref(), Some("Test Song"));
        assert_eq!(audio, b"AAAAAAAABBBBBBBBCCCC");
    }

    #[test]
    fn icy_strip_handles_split_input() {
        let mut strip = IcyStrip::new(4);
        let meta = b"StreamTitle='X';";
        let mut stream = Vec::new();
        stream.extend_from_slice(b"abcd");
        stream.push(1);
        stream.extend_from_slice(meta);
        stream.extend_from_slice(b"efgh");

        let mut audio = Vec::new();
        let mut title = None;
        for b in &stream {
            if let Some(t) = strip.strip(std::slice::from_ref(b), &mut audio) {
                title = Some(t);
            }
        }
        assert_eq!(title.as_deref(), Some("X"));
        assert_eq!(audio, b"abcdefgh");
    }

    #[test]
    fn full_body_with_length_ends_cleanly() {
        let body = vec![0x11u8; 500];
        let mut response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        response.extend_from_slice(&body);
        let (host, port, server) = serve_once(response);

        let mut s = stage();
        let buf = RingBuffer::new(4096);
        s.open(
            &StreamSource::Http(HttpSource::get(&host, port, "/t.raw", false)),
            100,
            false,
            Duration::from_secs(5),
        )
        .unwrap();
        drive(&mut s, &buf, 10_000);
        server.join().unwrap();

        assert!(s.ended());
        assert_eq!(s.disconnect_code(), DisconnectCode::Ok);
        assert_eq!(s.bytes_received(), 500);
        assert_eq!(buf.used(), 500);
        let mut saw_end = false;
        while let Some(ev) = s.take_event() {
            if ev == StreamEvent::EndOfStream {
                saw_end = true;
            }
            assert!(!matches!(ev, StreamEvent::Disconnected(_)));
        }
        assert!(saw_end);
    }

    #[test]
    fn premature_close_without_cont_wait_is_remote_disconnect() {
        let mut response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n".to_vec();
        response.extend_from_slice(&[0x22u8; 300]);
        let (host, port, server) = serve_once(response);

        let mut s = stage();
        let buf = RingBuffer::new(4096);
        s.open(
            &StreamSource::Http(HttpSource::get(&host, port, "/t.raw", false)),
            0,
            false,
            Duration::from_secs(5),
        )
        .unwrap();
        drive(&mut s, &buf, 10_000);
        server.join().unwrap();

        assert_eq!(s.disconnect_code(), DisconnectCode::RemoteDisconnect);
        let mut disconnects = 0;
        while let Some(ev) = s.take_event() {
            if matches!(ev, StreamEvent::Disconnected(DisconnectCode::RemoteDisconnect)) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
        // Buffers stay usable.
        buf.flush();
        assert_eq!(buf.used(), 0);
    }

    #[test]
    fn premature_close_with_cont_wait_defers_to_session_layer() {
        let mut response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n".to_vec();
        response.extend_from_slice(&[0x22u8; 300]);
        let (host, port, server) = serve_once(response);

        let mut s = stage();
        let buf = RingBuffer::new(4096);
        s.open(
            &StreamSource::Http(HttpSource::get(&host, port, "/t.raw", false)),
            0,
            true,
            Duration::from_secs(5),
        )
        .unwrap();
        drive(&mut s, &buf, 10_000);
        server.join().unwrap();

        assert_eq!(s.disconnect_code(), DisconnectCode::Ok);
        let events: Vec<_> = std::iter::from_fn(|| s.take_event()).collect();
        assert!(events.contains(&StreamEvent::TrackBoundary));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Disconnected(_))));
    }

    #[test]
    fn buffering_promotes_at_threshold() {
        let body = vec![0x33u8; 1000];
        let mut response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        response.extend_from_slice(&body);
        let (host, port, server) = serve_once(response);

        let mut s = stage();
        let buf = RingBuffer::new(4096);
        s.open(
            &StreamSource::Http(HttpSource::get(&host, port, "/t.raw", false)),
            256,
            false,
            Duration::from_secs(5),
        )
        .unwrap();
        let mut saw_buffering = false;
        for _ in 0..10_000 {
            if s.phase() == StreamPhase::Buffering {
                saw_buffering = true;
                assert!(buf.used() < 256 + READ_CHUNK);
            }
            if !s.run_once(&buf) {
                std::thread::sleep(Duration::from_millis(2));
            }
            if s.phase() == StreamPhase::Disconnected {
                break;
            }
        }
        server.join().unwrap();
        assert!(saw_buffering);
        assert!(s.ended());
        assert_eq!(buf.used(), 1000);
    }

    #[test]
    fn file_source_streams_to_end() {
        let dir = std::env::temp_dir().join(format!("stream-stage-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("track.raw");
        std::fs::write(&path, vec![0x44u8; 10_000]).unwrap();

        let mut s = stage();
        let buf = RingBuffer::new(4096);
        s.open(
            &StreamSource::File(path.clone()),
            0,
            false,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(s.phase(), StreamPhase::StreamingFile);

        let mut drained = 0u64;
        let mut scratch = [0u8; 1024];
        for _ in 0..100_000 {
            s.run_once(&buf);
            drained += buf.read(&mut scratch) as u64;
            if s.ended() && buf.used() == 0 {
                break;
            }
        }
        assert!(s.ended());
        assert_eq!(drained, 10_000);
        assert_eq!(s.bytes_received(), 10_000);
        let _ = std::fs::remove_file(&path);
    }
}
