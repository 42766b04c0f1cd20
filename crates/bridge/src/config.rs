use std::net::SocketAddr;
use std::time::Duration;

use render_bridge_types::{CodecId, EncodeMode, PcmFraming};
use render_pipeline::PipelineConfig;

/// Settings shared by both commands, mapped onto a pipeline config.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub audio_bind: String,
    pub rates: Vec<u32>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl BridgeConfig {
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            bind: self.audio_bind.clone(),
            supported_rates: self.rates.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            ..PipelineConfig::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub source: String,
    pub codec: Option<CodecId>,
    pub encode: EncodeMode,
    pub framing: PcmFraming,
    pub crossfade_ms: u32,
    pub bridge: BridgeConfig,
}

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub http_bind: SocketAddr,
    pub bridge: BridgeConfig,
}
