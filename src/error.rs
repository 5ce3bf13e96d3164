//! Error types for the parley voice pipeline

use thiserror::Error;

use crate::agent::BackendKind;

/// Result type alias for parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A capture session is already running
    #[error("capture already active")]
    AlreadyActive,

    /// Capture helper process error
    #[error("capture error: {0}")]
    Capture(String),

    /// Audio output error
    #[error("audio error: {0}")]
    Audio(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Operation was cancelled by a newer request or an explicit stop
    #[error("cancelled")]
    Cancelled,

    /// LLM backend request failed
    #[error("backend error ({backend}): {message}")]
    Backend {
        /// Backend that failed
        backend: BackendKind,
        /// Failure description
        message: String,
    },

    /// Operator-pinned backend is unreachable
    #[error(
        "configured backend {backend} is not reachable at {endpoint}; start it or set the backend to auto"
    )]
    BackendUnavailable {
        /// Pinned backend
        backend: BackendKind,
        /// Endpoint that was probed
        endpoint: String,
    },

    /// No backend answered the connectivity probe
    #[error("no LLM backend available")]
    NoBackendAvailable,

    /// Tool execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// File watcher error
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Plain-language description suitable for speaking to the user
    #[must_use]
    pub fn spoken(&self) -> String {
        match self {
            Self::BackendUnavailable { backend, .. } => {
                format!("I can't reach the {} backend you configured.", backend.label())
            }
            Self::NoBackendAvailable => {
                "I can't reach any language model right now.".to_string()
            }
            Self::Backend { .. } | Self::Http(_) => {
                "Something went wrong talking to the language model.".to_string()
            }
            Self::Tts(_) | Self::Audio(_) => "I couldn't play that reply.".to_string(),
            _ => "Sorry, something went wrong.".to_string(),
        }
    }
}
