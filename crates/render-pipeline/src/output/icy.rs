//! ICY metadata injection for the renderer-facing stream.
//!
//! When the renderer asked for metadata (`Icy-MetaData: 1`), every
//! `interval` bytes of audio payload are followed by one metadata block: a
//! length byte counting 16-byte units, then the padded block text. The block
//! carries content only when the track's title actually changed since the
//! last emission, and content updates are rate-limited; all other boundaries
//! get a zero-length block.

use std::time::{Duration, Instant};

use render_bridge_types::TrackMetadata;

/// Longest representable metadata block (255 length units of 16 bytes).
pub const ICY_LEN_MAX: usize = 255 * 16;
/// Minimum spacing between metadata content changes on the wire.
pub const ICY_UPDATE_TIME: Duration = Duration::from_millis(5000);

pub struct IcyInjector {
    interval: usize,
    /// Audio bytes until the next metadata block.
    remain: usize,
    current: Vec<u8>,
    updated: bool,
    last_emit: Option<Instant>,
}

impl IcyInjector {
    pub fn new(interval: usize) -> Self {
        Self {
            interval,
            remain: interval,
            current: Vec::new(),
            updated: false,
            last_emit: None,
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Update the block text from track metadata. Marks the stream dirty
    /// only when the rendered text differs from what was last emitted.
    pub fn set_metadata(&mut self, md: &TrackMetadata) {
        let title = match (md.artist.as_deref(), md.title.as_deref()) {
            (Some(artist), Some(title)) => format!("{artist} - {title}"),
            (None, Some(title)) => title.to_owned(),
            (Some(artist), None) => artist.to_owned(),
            (None, None) => String::new(),
        };
        let mut text = format!("StreamTitle='{}';", title.replace('\'', "`"));
        if let Some(url) = md.artwork_url.as_deref() {
            text.push_str(&format!("StreamUrl='{url}';"));
        }
        let mut rendered = text.into_bytes();
        rendered.truncate(ICY_LEN_MAX);
        if rendered != self.current {
            self.current = rendered;
            self.updated = true;
        }
    }

    /// Interleave metadata blocks into `audio`, appending the framed stream
    /// to `out`.
    pub fn process(&mut self, mut audio: &[u8], out: &mut Vec<u8>) {
        while !audio.is_empty() {
            if self.remain == 0 {
                self.emit_block(out);
                self.remain = self.interval;
            }
            let n = self.remain.min(audio.len());
            out.extend_from_slice(&audio[..n]);
            self.remain -= n;
            audio = &audio[n..];
        }
        if self.remain == 0 {
            self.emit_block(out);
            self.remain = self.interval;
        }
    }

    fn emit_block(&mut self, out: &mut Vec<u8>) {
        let rate_ok = self
            .last_emit
            .map(|t| t.elapsed() >= ICY_UPDATE_TIME)
            .unwrap_or(true);
        if self.updated && rate_ok && !self.current.is_empty() {
            let units = self.current.len().div_ceil(16);
            out.push(units as u8);
            let start = out.len();
            out.extend_from_slice(&self.current);
            out.resize(start + units * 16, 0);
            self.updated = false;
            self.last_emit = Some(Instant::now());
            tracing::debug!(len = self.current.len(), "icy metadata emitted");
        } else {
            out.push(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(artist: &str, title: &str) -> TrackMetadata {
        TrackMetadata {
            artist: Some(artist.to_owned()),
            title: Some(title.to_owned()),
            ..TrackMetadata::default()
        }
    }

    /// Walk a framed stream, returning (audio, blocks).
    fn deframe(stream: &[u8], interval: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut audio = Vec::new();
        let mut blocks = Vec::new();
        let mut i = 0;
        loop {
            let n = interval.min(stream.len() - i);
            audio.extend_from_slice(&stream[i..i + n]);
            i += n;
            if i >= stream.len() {
                break;
            }
            let len = stream[i] as usize * 16;
            i += 1;
            blocks.push(stream[i..i + len].to_vec());
            i += len;
        }
        (audio, blocks)
    }

    #[test]
    fn blocks_appear_every_interval() {
        let mut icy = IcyInjector::new(100);
        icy.set_metadata(&md("A", "B"));
        let audio = vec![0x7fu8; 350];
        let mut out = Vec::new();
        icy.process(&audio, &mut out);

        let (deframed, blocks) = deframe(&out, 100);
        assert_eq!(deframed, audio);
        assert_eq!(blocks.len(), 3);
    }

    #[test]
    fn only_first_block_carries_content() {
        let mut icy = IcyInjector::new(10);
        icy.set_metadata(&md("Artist", "Song"));
        let mut out = Vec::new();
        icy.process(&[0u8; 30], &mut out);

        let (_, blocks) = deframe(&out, 10);
        assert_eq!(blocks.len(), 3);
        let text = String::from_utf8_lossy(&blocks[0]);
        assert!(text.starts_with("StreamTitle='Artist - Song';"), "{text}");
        assert!(blocks[0].len() % 16 == 0);
        assert!(blocks[1].is_empty());
        assert!(blocks[2].is_empty());
    }

    #[test]
    fn repeated_metadata_is_not_re_emitted() {
        let mut icy = IcyInjector::new(10);
        icy.set_metadata(&md("A", "B"));
        let mut out = Vec::new();
        icy.process(&[0u8; 10], &mut out);
        // Same metadata again: no dirty flag, next block stays empty.
        icy.set_metadata(&md("A", "B"));
        out.clear();
        icy.process(&[0u8; 10], &mut out);
        let (_, blocks) = deframe(&out, 10);
        assert!(blocks[0].is_empty());
    }

    #[test]
    fn title_change_is_rate_limited() {
        let mut icy = IcyInjector::new(10);
        icy.set_metadata(&md("A", "one"));
        let mut out = Vec::new();
        icy.process(&[0u8; 10], &mut out);
        let (_, blocks) = deframe(&out, 10);
        assert!(!blocks[0].is_empty());

        // A change right after the first emission is held back.
        icy.set_metadata(&md("A", "two"));
        out.clear();
        icy.process(&[0u8; 10], &mut out);
        let (_, blocks) = deframe(&out, 10);
        assert!(blocks[0].is_empty());
        // Still dirty; it will go out once the rate limit passes.
        assert!(icy.updated);
    }

    #[test]
    fn quotes_in_titles_are_defanged() {
        let mut icy = IcyInjector::new(10);
        icy.set_metadata(&md("O'Brien", "Song"));
        let mut out = Vec::new();
        icy.process(&[0u8; 10], &mut out);
        let (_, blocks) = deframe(&out, 10);
        let text = String::from_utf8_lossy(&blocks[0]);
        assert!(text.contains("O`Brien"));
    }
}
