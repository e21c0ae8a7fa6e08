// Core building blocks
pub mod error;
pub mod frame;
pub mod rate_limit;

// Configuration
pub mod config;

// Frame pipeline
pub mod buffer;
pub mod source;

// HTTP front end
pub mod streaming;

/// Server identity, advertised in the `Server` response header and used as
/// the default upstream `User-Agent`.
pub const SERVER_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

// Re-export common types at the crate root
pub use buffer::{
    build_buffer, BufferBuilder, BufferManager, FailsafeBuffer, FrameBuffer, FrameItem,
    FrameStream, ManagedStream, StaticImageBuffer, VideoBuffer,
};
pub use config::{
    spawn_config_watcher, BufferConfig, ConfigStore, RelayConfig, ReloadableSettings, Settings,
    StaticSourceConfig, WebcamBufferConfig, WebcamEndpoint,
};
pub use error::{RelayError, Result, SourceError, StreamError};
pub use frame::Frame;
pub use rate_limit::{BackoffRateLimiter, BucketRateLimiter};
pub use source::{FrameSource, SourceItem, WebcamStillSource, WebcamVideoSource};
pub use streaming::{RelayServer, ServerState, StreamStats, STREAM_BOUNDARY};
