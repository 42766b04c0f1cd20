use std::net::SocketAddr;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bridge", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Renderer-facing audio listener bind address (port 0 = ephemeral)
    #[arg(long, default_value = "0.0.0.0:0")]
    pub audio_bind: String,

    /// Sample rates the renderer accepts, e.g. 44100,48000,96000 (empty = any)
    #[arg(long, value_delimiter = ',')]
    pub rates: Vec<u32>,

    /// Source connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Source read timeout in seconds
    #[arg(long, default_value_t = 15)]
    pub read_timeout: u64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream one source (file path or http URL) to the renderer and exit
    Play {
        /// Path to an audio file, or an http:// URL to relay
        source: String,

        /// Source codec as its protocol character (p/f/m/a/l/o); guessed
        /// from the extension when omitted
        #[arg(long)]
        codec: Option<char>,

        /// Forward compressed bytes untouched instead of decoding
        #[arg(long)]
        thru: bool,

        /// Renderer framing for decoded audio: wav, aiff or raw
        #[arg(long, default_value = "wav")]
        framing: String,

        /// Crossfade duration in milliseconds (0 = off)
        #[arg(long, default_value_t = 0)]
        crossfade_ms: u32,
    },

    /// Run the bridge HTTP control API for remote sessions
    Serve {
        /// Control API bind address
        #[arg(long, default_value = "0.0.0.0:5556")]
        http_bind: SocketAddr,
    },
}
