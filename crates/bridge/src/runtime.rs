//! Bridge runtime: one-shot playback and the long-running control API.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use render_bridge_types::{
    CodecId, DisconnectCode, EncodeMode, FadeMode, PcmFraming, SampleFormat, StatusEvent,
    TrackMetadata,
};
use render_pipeline::{
    HttpSource, PipelineContext, PlayerRegistry, StreamDescriptor, StreamSource,
};

use crate::config::{PlayConfig, ServeConfig};
use crate::http_api;

/// Stream one source to the renderer, wait for it to finish, exit.
pub fn run_play(config: PlayConfig, install_ctrlc: bool) -> Result<()> {
    let source = parse_source(&config.source)?;
    let codec = match config.codec {
        Some(c) => c,
        None => guess_codec(&config.source)
            .with_context(|| format!("cannot guess codec for {:?}", config.source))?,
    };

    let (ctx, events) = PipelineContext::start(config.bridge.pipeline())?;
    if config.crossfade_ms > 0 {
        ctx.set_fade(FadeMode::Crossfade, config.crossfade_ms);
    }
    if install_ctrlc {
        let ctx_for_signal = Arc::clone(&ctx);
        let _ = ctrlc::set_handler(move || {
            ctx_for_signal.shutdown();
            std::process::exit(130);
        });
    }

    let title = PathBuf::from(&config.source)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned());
    ctx.open_stream(StreamDescriptor {
        source,
        codec,
        format: SampleFormat::default(),
        encode_mode: config.encode,
        framing: config.framing,
        threshold: 0,
        cont_wait: false,
        icy_interval: 0,
        metadata: TrackMetadata {
            title,
            ..TrackMetadata::default()
        },
    })?;
    tracing::info!(port = ctx.port(), "renderer audio available");

    let done = AtomicBool::new(false);
    loop {
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(StatusEvent::TrackStarted { index }) => {
                tracing::info!(index, "renderer started pulling");
            }
            Ok(StatusEvent::TrackComplete { index }) => {
                tracing::info!(index, "track complete, draining tail");
                done.store(true, Ordering::SeqCst);
            }
            Ok(StatusEvent::PositionUpdate { ms_played }) => {
                tracing::debug!(ms_played, "position");
            }
            Ok(StatusEvent::Disconnected { code }) => match code {
                DisconnectCode::Ok | DisconnectCode::LocalDisconnect => {}
                code => {
                    ctx.shutdown();
                    bail!("source disconnected: {code:?}");
                }
            },
            Ok(StatusEvent::DecodeError) => {
                ctx.shutdown();
                bail!("decode failed");
            }
            Ok(StatusEvent::PlaybackStopped) => {
                ctx.shutdown();
                bail!("renderer dropped the connection");
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
        if done.load(Ordering::SeqCst) && !ctx.snapshot().output_ready {
            break;
        }
    }
    ctx.shutdown();
    Ok(())
}

/// Run the control API; players are created and driven over HTTP.
pub fn run_serve(config: ServeConfig, install_ctrlc: bool) -> Result<()> {
    let registry = Arc::new(PlayerRegistry::new());

    if install_ctrlc {
        let registry_for_signal = Arc::clone(&registry);
        let _ = ctrlc::set_handler(move || {
            registry_for_signal.shutdown_all();
            std::process::exit(130);
        });
    }

    // Status events are logged here; clients poll snapshots over HTTP.
    let events = registry.events();
    std::thread::spawn(move || {
        for (handle, event) in events {
            tracing::info!(player = handle.index(), ?event, "player event");
        }
    });

    let http = http_api::spawn_http_server(
        config.http_bind,
        Arc::clone(&registry),
        config.bridge.clone(),
    );
    let _ = http.join();
    Ok(())
}

/// A source string is either an `http://` URL or a local path.
pub fn parse_source(s: &str) -> Result<StreamSource> {
    let Some(rest) = s.strip_prefix("http://") else {
        return Ok(StreamSource::File(PathBuf::from(s)));
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().with_context(|| format!("bad port in {s}"))?),
        None => (authority, 80),
    };
    if host.is_empty() {
        bail!("missing host in {s}");
    }
    Ok(StreamSource::Http(HttpSource::get(host, port, path, false)))
}

/// Codec from the source's file extension.
pub fn guess_codec(source: &str) -> Option<CodecId> {
    let ext = source.rsplit('.').next()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "flac" => CodecId::Flac,
        "mp3" => CodecId::Mp3,
        "aac" | "adts" => CodecId::Aac,
        "m4a" | "mp4" => CodecId::Alac,
        "ogg" | "oga" => CodecId::Vorbis,
        "wav" | "aif" | "aiff" | "pcm" | "raw" => CodecId::Pcm,
        _ => return None,
    })
}

pub fn parse_framing(s: &str) -> Result<PcmFraming> {
    Ok(match s {
        "wav" => PcmFraming::Wav,
        "aiff" => PcmFraming::Aiff,
        "raw" => PcmFraming::Raw,
        other => bail!("unknown framing {other:?} (expected wav, aiff or raw)"),
    })
}

pub fn encode_mode(thru: bool) -> EncodeMode {
    if thru { EncodeMode::Thru } else { EncodeMode::Pcm }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_source_http_with_port_and_path() {
        let StreamSource::Http(http) = parse_source("http://10.0.0.5:9000/stream/42.flac").unwrap()
        else {
            panic!("expected http source");
        };
        assert_eq!(http.host, "10.0.0.5");
        assert_eq!(http.port, 9000);
    }

    #[test]
    fn parse_source_http_defaults() {
        let StreamSource::Http(http) = parse_source("http://radio.example").unwrap() else {
            panic!("expected http source");
        };
        assert_eq!(http.port, 80);
        assert!(http.request.starts_with("GET / HTTP/1.0\r\n"));
    }

    #[test]
    fn parse_source_plain_path() {
        assert!(matches!(
            parse_source("/music/a.flac").unwrap(),
            StreamSource::File(_)
        ));
    }

    #[test]
    fn parse_source_rejects_bad_port() {
        assert!(parse_source("http://h:notaport/x").is_err());
    }

    #[test]
    fn guess_codec_from_extension() {
        assert_eq!(guess_codec("/a/b/track.FLAC"), Some(CodecId::Flac));
        assert_eq!(guess_codec("song.mp3"), Some(CodecId::Mp3));
        assert_eq!(guess_codec("noext"), None);
    }

    #[test]
    fn framing_names() {
        assert_eq!(parse_framing("aiff").unwrap(), PcmFraming::Aiff);
        assert!(parse_framing("ogg").is_err());
    }
}
