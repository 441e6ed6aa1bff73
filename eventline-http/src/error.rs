use std::io;

/// Errors produced by the HTTP client and server.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The connection was closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation was cancelled via its stop token.
    #[error("interrupted")]
    Interrupted,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Wire parsing error.
    #[error("parse error")]
    Parse,

    /// The transfer timed out.
    #[error("timeout")]
    Timeout,

    /// Protocol error (unexpected event, bad state).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Event loop registration failed.
    #[error("event loop error: {0}")]
    EventLoop(#[from] eventline::Error),

    /// TLS setup or handshake error.
    #[cfg(feature = "tls")]
    #[error("tls error: {0}")]
    Tls(String),
}

impl HttpError {
    /// Whether this error is a cancellation rather than a failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, HttpError::Interrupted)
    }
}
