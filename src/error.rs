//! Error types for the voice relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Recognition session failed (fatal to the current run only)
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Generation collaborator rejected the prompt or failed mid-stream
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// Synthesis failed for a single sentence
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    /// Client channel closed; triggers cancellation, never reported to the client
    #[error("connection closed")]
    ConnectionClosed,

    /// Web search failed; the reply falls back to the plain prompt
    #[error("search failed: {0}")]
    SearchFailed(String),

    /// Invalid message from the client
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket client error
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl Error {
    /// Short machine-readable code sent to clients in `error` messages
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Recognition(_) => "recognition_error",
            Self::GenerationFailed(_) => "generation_failed",
            Self::SynthesisFailed(_) => "synthesis_failed",
            Self::SearchFailed(_) => "search_failed",
            Self::ConnectionClosed => "connection_closed",
            Self::InvalidMessage(_) => "invalid_message",
            _ => "internal_error",
        }
    }
}
