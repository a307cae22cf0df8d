//! Process management traits and types

use async_trait::async_trait;
use crate::error::Result;

/// A handle to control a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to complete and return its exit status
    async fn wait(&mut self) -> Result<ExitStatus>;

    /// Send SIGTERM (or equivalent) for graceful shutdown
    async fn terminate(&mut self) -> Result<()>;

    /// Send SIGKILL (or equivalent) to forcefully stop the process
    async fn kill(&mut self) -> Result<()>;
}

/// Process exit status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Status of a process that exited with `code`
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some()
    }
}

/// Outcome of a command that was run to completion
#[derive(Debug, Clone)]
pub struct ExitResult {
    /// Exit status of the command
    pub status: ExitStatus,
    /// Stdout and stderr lines in arrival order
    pub output: String,
    /// Stdout lines only
    pub stdout: String,
    /// Stderr lines only
    pub stderr: String,
}

impl ExitResult {
    /// Returns true if the command exited with code 0
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, if the command was not killed by a signal
    pub fn code(&self) -> Option<i32> {
        self.status.code
    }
}
