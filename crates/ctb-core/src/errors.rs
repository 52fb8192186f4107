use std::path::PathBuf;

/// Core error type for the bot.
///
/// Adapter crates map their specific errors into this type so the relay can
/// decide what the user sees (readable message) and what only gets logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Sender is not the allowed username. Never shown to the sender.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Stored session is past its timeout. Recovered by allocating a new id.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Claude CLI failed, exited non-zero or timed out.
    #[error("invocation error: {0}")]
    Invocation(String),

    /// The run was stopped by the user.
    #[error("cancelled")]
    Cancelled,

    /// Telegram rejected or never received a message/document.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
