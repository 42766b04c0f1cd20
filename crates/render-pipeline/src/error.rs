//! Pipeline error taxonomy.
//!
//! Transient network faults and renderer drops are reported as events, not
//! errors; this type covers the synchronous failure paths of the
//! session-facing API (bad descriptors, unreachable sources, exhausted
//! player slots).

use render_bridge_types::CodecId;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("no codec registered for {0:?}")]
    UnsupportedCodec(CodecId),

    #[error("codec open failed: {0}")]
    CodecOpen(String),

    #[error("resampler: {0}")]
    Transform(String),

    #[error("player is already streaming; stop it first")]
    Busy,

    #[error("no free player slot")]
    NoFreeSlot,

    #[error("stale player handle")]
    StaleHandle,

    #[error("http listener: {0}")]
    Listener(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
