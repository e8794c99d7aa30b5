use std::io;
use thiserror::Error;

/// Central error type for the Etude engine.
///
/// Only failures of the server itself land here. A malformed request, a
/// missing file or a peer reset is a per-connection outcome and never
/// becomes an `EtudeError`.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    Address(String),

    /// An environment value could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    Config { key: &'static str, value: String },

    /// The Ctrl-C handler could not be installed.
    #[error("signal handler: {0}")]
    Signal(String),

    /// A worker thread failed to start.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(io::Error),
}

pub type EtudeResult<T> = Result<T, EtudeError>;
