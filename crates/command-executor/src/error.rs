//! Error types for command execution

use thiserror::Error;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Failed to send signal to process
    #[error("failed to send signal {signal}: {reason}")]
    SignalFailed {
        /// The signal number that failed to send
        signal: i32,
        /// The reason for the signal failure
        reason: String,
    },

    /// A command ran but exited unsuccessfully
    #[error("command on {host} exited with {code:?}: {command}\n{output}")]
    CommandFailed {
        /// Host the command ran on
        host: String,
        /// The command line that failed
        command: String,
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// Combined output captured from the command
        output: String,
    },

    /// The host did not answer a trivial command
    #[error("connectivity check to {host} failed: {reason}")]
    ConnectivityFailed {
        /// The hostname or IP address that failed to connect
        host: String,
        /// Output or reason reported by the transport
        reason: String,
    },

    /// Copying a file to or from a host failed
    #[error("copy {from} -> {to} failed: {reason}")]
    CopyFailed {
        /// Source of the copy
        from: String,
        /// Destination of the copy
        to: String,
        /// Output or reason reported by the transport
        reason: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Nix error (Unix signal handling)
    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create a signal failed error
    pub fn signal_failed(signal: i32, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            signal,
            reason: reason.into(),
        }
    }

    /// Add layer context to a spawn error message
    pub fn with_layer_context(self, layer: impl Into<String>) -> Self {
        match self {
            Error::SpawnFailed { reason } => Error::SpawnFailed {
                reason: format!("{} layer: {}", layer.into(), reason),
            },
            other => other,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
