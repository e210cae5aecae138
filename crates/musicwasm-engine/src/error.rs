//! Engine error types.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("module error {code}: {reason}")]
    Module { code: i32, reason: String },

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("call error: {0}")]
    Call(String),

    #[error("wasm trap: {0}")]
    Trap(String),

    #[error("call timed out: {0}")]
    Timeout(String),

    #[error("maximum retry count exceeded after {0} attempts")]
    MaximumRetryExceeded(u32),

    #[error("download error: {0}")]
    Download(String),

    #[error("activation error: {0}")]
    Activation(String),

    #[error("path outside cache directory: {0}")]
    OutsideCache(String),

    #[error("version {0} is active")]
    InUse(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("engine is not running")]
    NotRunning,

    #[error("operation cancelled")]
    Cancelled,

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl EngineError {
    /// True for failures raised by the module call itself (trap, timeout,
    /// runtime error), as opposed to codec or host-side failures.
    pub fn is_call_error(&self) -> bool {
        matches!(self, Self::Call(_) | Self::Trap(_) | Self::Timeout(_))
    }
}
