use thiserror::Error;

/// Error type shared across the control plane.
///
/// Transient variants (request failures, `Unavailable`) are retried by the
/// supervisor loop and never surface past it; `TokenExpired` downgrades the
/// session to unlinked until the next auth refresh.
#[derive(Debug, Error)]
pub enum Error {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("lounge token expired")]
    TokenExpired,

    #[error("lounge session expired")]
    SessionExpired,

    #[error("not connected to device")]
    NotConnected,

    #[error("device unavailable")]
    Unavailable,

    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
