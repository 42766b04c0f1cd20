pub mod buffer;
pub mod codec;
pub mod context;
pub mod decode;
pub mod error;
pub mod output;
pub mod players;
pub mod process;
pub mod stream;
pub mod wake;

pub use context::{PipelineConfig, PipelineContext, StreamDescriptor};
pub use error::{PipelineError, Result};
pub use players::{PlayerHandle, PlayerRegistry};
pub use stream::{HttpSource, StreamSource};
