use std::io;

use thiserror::Error;

/// Errors returned by the event loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Poller setup or wait failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A watcher referenced a registration that no longer exists.
    #[error("stale event registration")]
    StaleRegistration,
}
