use thiserror::Error;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("Configuration file changed during reload")]
    ConfigReloadRace,

    #[error("Cannot determine content type for {path}")]
    UnknownContentType { path: String },

    #[error("Neither webcam streaming nor still capture is configured")]
    NotConfigured,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream source error: {0}")]
    Source(#[from] SourceError),

    #[error("Stream server error: {0}")]
    Stream(#[from] StreamError),
}

/// Upstream acquisition error types.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Invalid webcam URL {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("Only http URLs are supported: {url}")]
    UnsupportedScheme { url: String },

    #[error("HTTP authentication is not supported: {url}")]
    CredentialsNotSupported { url: String },

    #[error("Unexpected response status: {status}")]
    UnexpectedStatus { status: u16 },

    #[error("Connection failed: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("Malformed stream: {details}")]
    Protocol { details: String },

    #[error("Read failed: {0}")]
    Read(#[from] std::io::Error),
}

impl SourceError {
    /// Create a protocol error with a detail message.
    pub fn protocol<S: Into<String>>(details: S) -> Self {
        Self::Protocol {
            details: details.into(),
        }
    }
}

/// Stream server error types.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Server error: {details}")]
    Serve { details: String },
}

/// Convenience type alias for Results.
pub type Result<T> = std::result::Result<T, RelayError>;
