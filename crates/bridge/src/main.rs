//! Render Bridge — streams audio from a media server to a network renderer.
//!
//! ## Pipeline (per player)
//! 1. **Stream**: a background thread pulls the source (HTTP or file) into
//!    the input ring buffer, stripping in-band ICY metadata.
//! 2. **Decode**: a background thread decodes via Symphonia (or passes PCM
//!    through), resamples with Rubato when the renderer needs it, and fills
//!    the output ring buffer with 32-bit interleaved stereo.
//! 3. **Output**: the renderer fetches the audio over HTTP; fades, gain,
//!    WAV/AIFF framing and ICY re-injection are applied as it pulls.
//!
//! ## Modes
//! - `play`: stream one source and exit when the renderer has it all.
//! - `serve`: run the HTTP control API; sessions create players remotely.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bridge::cli;
use bridge::config::{BridgeConfig, PlayConfig, ServeConfig};
use bridge::runtime;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bridge=info")),
        )
        .init();

    let bridge = BridgeConfig {
        audio_bind: args.audio_bind.clone(),
        rates: args.rates.clone(),
        connect_timeout: Duration::from_secs(args.connect_timeout),
        read_timeout: Duration::from_secs(args.read_timeout),
    };

    match args.cmd {
        cli::Command::Play {
            source,
            codec,
            thru,
            framing,
            crossfade_ms,
        } => runtime::run_play(
            PlayConfig {
                source,
                codec: codec.and_then(render_bridge_types::CodecId::from_char),
                encode: runtime::encode_mode(thru),
                framing: runtime::parse_framing(&framing)?,
                crossfade_ms,
                bridge,
            },
            true,
        ),
        cli::Command::Serve { http_bind } => {
            runtime::run_serve(ServeConfig { http_bind, bridge }, true)
        }
    }
}
