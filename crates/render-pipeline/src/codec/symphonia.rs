//! Probe-based decoder for compressed sources.
//!
//! Symphonia's format readers want a blocking `MediaSource`, while the
//! decode stage is a non-blocking poll loop. The codec bridges the two with
//! an internal worker thread: encoded bytes flow through a bounded byte
//! queue into the probe/decoder, decoded samples come back through a bounded
//! sample queue. Each `decode` step is just glue moving data across both
//! queues without blocking.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{Codec, CodecParams, DecodeContext, DecodeOutcome};
use crate::error::Result;
use render_bridge_types::CodecId;

/// Encoded bytes buffered ahead of the probe/decoder.
const INPUT_CAPACITY: usize = 256 * 1024;
/// Decoded samples buffered behind it (32k stereo frames).
const OUTPUT_CAPACITY: usize = 64 * 1024;

pub struct SymphoniaCodec {
    id: CodecId,
    worker: Option<Worker>,
    total_bytes: Option<u64>,
    rate_announced: bool,
    input_closed: bool,
}

struct Worker {
    input: Arc<ByteQueue>,
    output: Arc<SampleQueue>,
    handle: Option<JoinHandle<()>>,
}

impl SymphoniaCodec {
    pub fn new(id: CodecId) -> Self {
        Self {
            id,
            worker: None,
            total_bytes: None,
            rate_announced: false,
            input_closed: false,
        }
    }

    fn spawn_worker(&mut self) {
        let input = Arc::new(ByteQueue::new(INPUT_CAPACITY));
        let output = Arc::new(SampleQueue::new(OUTPUT_CAPACITY));
        let source = QueueSource {
            queue: Arc::clone(&input),
            total: self.total_bytes,
        };
        let out = Arc::clone(&output);
        let ext = self.id.extension().to_owned();
        let handle = std::thread::Builder::new()
            .name("decode-worker".into())
            .spawn(move || run_decoder(source, &ext, &out))
            .ok();
        self.worker = Some(Worker {
            input,
            output,
            handle,
        });
    }
}

impl Codec for SymphoniaCodec {
    fn id(&self) -> CodecId {
        self.id
    }

    fn min_read_bytes(&self) -> usize {
        2048
    }

    fn min_space(&self) -> usize {
        2048
    }

    fn open(&mut self, params: &CodecParams) -> Result<()> {
        self.close();
        self.total_bytes = params.total_bytes;
        self.rate_announced = false;
        self.input_closed = false;
        self.spawn_worker();
        Ok(())
    }

    fn decode(&mut self, cx: &mut DecodeContext<'_>) -> DecodeOutcome {
        let Some(worker) = self.worker.as_ref() else {
            return DecodeOutcome::Error;
        };

        // Feed the probe side.
        let mut room = worker.input.space();
        while room > 0 && cx.streambuf.used() > 0 {
            let n = room.min(cx.streambuf.used()).min(4096);
            let mut chunk = vec![0u8; n];
            let got = cx.streambuf.read(&mut chunk);
            worker.input.push(&chunk[..got]);
            room -= got;
        }
        if cx.stream_ended && !self.input_closed {
            worker.input.close();
            self.input_closed = true;
        }

        // Drain the decoded side.
        if !self.rate_announced {
            if let Some(rate) = worker.output.rate() {
                cx.sink.set_rate(rate);
                self.rate_announced = true;
            }
        }
        if self.rate_announced {
            loop {
                let want = cx.sink.space_frames() * 2;
                if want == 0 {
                    break;
                }
                let samples = worker.output.pop(want.min(8192));
                if samples.is_empty() {
                    break;
                }
                cx.sink.write_frames(&samples);
            }
        }

        if worker.output.failed() {
            return DecodeOutcome::Error;
        }
        if worker.output.finished() {
            return DecodeOutcome::Complete;
        }
        DecodeOutcome::Running
    }

    fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.input.close();
            worker.output.close();
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SymphoniaCodec {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_decoder(source: QueueSource, ext: &str, out: &SampleQueue) {
    let mss = MediaSourceStream::new(Box::new(source), Default::default());
    let mut hint = Hint::new();
    hint.with_extension(ext);

    let probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!(error = %err, "format probe failed");
            out.fail();
            return;
        }
    };

    let mut format = probed.format;
    let Some(track) = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .cloned()
    else {
        tracing::warn!("no decodable track in stream");
        out.fail();
        return;
    };

    let mut decoder = match symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
    {
        Ok(d) => d,
        Err(err) => {
            tracing::warn!(error = %err, "decoder init failed");
            out.fail();
            return;
        }
    };

    let mut sample_buf: Option<SampleBuffer<i32>> = None;
    let mut bad_packets = 0u32;
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(err))
                if err.kind() == io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(err) => {
                tracing::debug!(error = %err, "end of packet stream");
                break;
            }
        };
        if packet.track_id() != track.id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(err)) => {
                // Tolerate isolated corrupt packets, bail on a run of them.
                bad_packets += 1;
                tracing::debug!(error = %err, bad_packets, "corrupt packet skipped");
                if bad_packets > 16 {
                    out.fail();
                    return;
                }
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "decode failed");
                out.fail();
                return;
            }
        };
        bad_packets = 0;

        let spec = *decoded.spec();
        out.set_rate(spec.rate);
        let buf = sample_buf.get_or_insert_with(|| {
            SampleBuffer::<i32>::new(decoded.capacity() as u64, spec)
        });
        if buf.capacity() < decoded.capacity() * spec.channels.count() {
            *buf = SampleBuffer::<i32>::new(decoded.capacity() as u64, spec);
        }
        buf.copy_interleaved_ref(decoded);

        let channels = spec.channels.count();
        let pushed = match channels {
            2 => out.push_blocking(buf.samples()),
            1 => {
                let stereo: Vec<i32> =
                    buf.samples().iter().flat_map(|&s| [s, s]).collect();
                out.push_blocking(&stereo)
            }
            n => {
                let stereo: Vec<i32> = buf
                    .samples()
                    .chunks_exact(n)
                    .flat_map(|f| [f[0], f[1]])
                    .collect();
                out.push_blocking(&stereo)
            }
        };
        if !pushed {
            // Consumer went away.
            return;
        }
    }
    out.finish();
}

/// Bounded byte FIFO; the push side never blocks, the read side blocks
/// until bytes arrive or the queue is closed.
struct ByteQueue {
    state: Mutex<ByteQueueState>,
    cond: Condvar,
    capacity: usize,
}

struct ByteQueueState {
    data: VecDeque<u8>,
    closed: bool,
}

impl ByteQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ByteQueueState {
                data: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    fn space(&self) -> usize {
        let g = self.state.lock().unwrap();
        self.capacity - g.data.len().min(self.capacity)
    }

    fn push(&self, bytes: &[u8]) -> usize {
        let mut g = self.state.lock().unwrap();
        let take = bytes
            .len()
            .min(self.capacity - g.data.len().min(self.capacity));
        g.data.extend(&bytes[..take]);
        drop(g);
        self.cond.notify_one();
        take
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

/// Blocking read half of a [`ByteQueue`], presented to symphonia.
struct QueueSource {
    queue: Arc<ByteQueue>,
    total: Option<u64>,
}

impl io::Read for QueueSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut g = self.queue.state.lock().unwrap();
        while g.data.is_empty() && !g.closed {
            g = self.queue.cond.wait(g).unwrap();
        }
        if g.data.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(g.data.len());
        for (i, b) in g.data.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }
}

impl io::Seek for QueueSource {
    fn seek(&mut self, _pos: io::SeekFrom) -> io::Result<u64> {
        // Live queue; `is_seekable` already reports false.
        Err(io::Error::new(io::ErrorKind::Unsupported, "stream source"))
    }
}

impl MediaSource for QueueSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        self.total
    }
}

/// Bounded decoded-sample FIFO between the worker and the decode stage.
struct SampleQueue {
    state: Mutex<SampleQueueState>,
    cond: Condvar,
    capacity: usize,
}

struct SampleQueueState {
    samples: VecDeque<i32>,
    rate: Option<u32>,
    done: bool,
    failed: bool,
    closed: bool,
}

impl SampleQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SampleQueueState {
                samples: VecDeque::with_capacity(capacity),
                rate: None,
                done: false,
                failed: false,
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    fn set_rate(&self, rate: u32) {
        let mut g = self.state.lock().unwrap();
        if g.rate != Some(rate) {
            g.rate = Some(rate);
        }
    }

    fn rate(&self) -> Option<u32> {
        self.state.lock().unwrap().rate
    }

    /// Blocks while full. Returns false if the consumer closed the queue.
    fn push_blocking(&self, samples: &[i32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.state.lock().unwrap();
            while g.samples.len() >= self.capacity && !g.closed {
                g = self.cond.wait(g).unwrap();
            }
            if g.closed {
                return false;
            }
            let room = self.capacity - g.samples.len();
            let take = room.min(samples.len() - offset);
            g.samples.extend(&samples[offset..offset + take]);
            offset += take;
        }
        true
    }

    fn pop(&self, max: usize) -> Vec<i32> {
        let mut g = self.state.lock().unwrap();
        // Keep sample pairs intact.
        let n = max.min(g.samples.len()) & !1;
        let out: Vec<i32> = g.samples.drain(..n).collect();
        drop(g);
        self.cond.notify_one();
        out
    }

    fn finish(&self) {
        self.state.lock().unwrap().done = true;
    }

    fn finished(&self) -> bool {
        let g = self.state.lock().unwrap();
        g.done && g.samples.is_empty()
    }

    fn fail(&self) {
        self.state.lock().unwrap().failed = true;
    }

    fn failed(&self) -> bool {
        self.state.lock().unwrap().failed
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;
    use crate::codec::test_sink::VecSink;
    use render_bridge_types::SampleFormat;
    use std::time::{Duration, Instant};

    /// Minimal 16-bit LE mono WAV container around `samples`.
    fn wav_bytes(rate: u32, samples: &[i16]) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut v = Vec::new();
        v.extend_from_slice(b"RIFF");
        v.extend_from_slice(&(36 + data_len).to_le_bytes());
        v.extend_from_slice(b"WAVE");
        v.extend_from_slice(b"fmt ");
        v.extend_from_slice(&16u32.to_le_bytes());
        v.extend_from_slice(&1u16.to_le_bytes()); // PCM
        v.extend_from_slice(&1u16.to_le_bytes()); // mono
        v.extend_from_slice(&rate.to_le_bytes());
        v.extend_from_slice(&(rate * 2).to_le_bytes());
        v.extend_from_slice(&2u16.to_le_bytes());
        v.extend_from_slice(&16u16.to_le_bytes());
        v.extend_from_slice(b"data");
        v.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            v.extend_from_slice(&s.to_le_bytes());
        }
        v
    }

    #[test]
    fn decodes_wav_to_stereo_samples() {
        let samples: Vec<i16> = (0..512).map(|i| (i * 7) as i16).collect();
        let wav = wav_bytes(8000, &samples);

        let mut codec = SymphoniaCodec::new(CodecId::Pcm);
        codec
            .open(&CodecParams {
                id: CodecId::Pcm,
                format: SampleFormat::default(),
                total_bytes: Some(wav.len() as u64),
            })
            .unwrap();

        let rb = RingBuffer::new(wav.len());
        assert_eq!(rb.write(&wav), wav.len());
        let mut sink = VecSink::new();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let mut cx = DecodeContext {
                streambuf: &rb,
                sink: &mut sink,
                stream_ended: true,
            };
            match codec.decode(&mut cx) {
                DecodeOutcome::Complete => break,
                DecodeOutcome::Error => panic!("decode error"),
                DecodeOutcome::Running => {
                    assert!(Instant::now() < deadline, "decode did not finish");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
        codec.close();

        assert_eq!(sink.rate, Some(8000));
        // Mono gets duplicated into both channels.
        assert_eq!(sink.frames.len(), samples.len() * 2);
        assert_eq!(sink.frames[0], sink.frames[1]);
        assert_eq!(sink.frames[2], (7i32) << 16);
    }

    #[test]
    fn garbage_input_reports_error() {
        let mut codec = SymphoniaCodec::new(CodecId::Flac);
        codec
            .open(&CodecParams {
                id: CodecId::Flac,
                format: SampleFormat::default(),
                total_bytes: None,
            })
            .unwrap();

        let rb = RingBuffer::new(4096);
        rb.write(&[0xA5u8; 4096]);
        let mut sink = VecSink::new();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let mut cx = DecodeContext {
                streambuf: &rb,
                sink: &mut sink,
                stream_ended: true,
            };
            match codec.decode(&mut cx) {
                DecodeOutcome::Error => break,
                DecodeOutcome::Complete => panic!("garbage decoded cleanly"),
                DecodeOutcome::Running => {
                    assert!(Instant::now() < deadline, "probe never failed");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
        codec.close();
    }
}
