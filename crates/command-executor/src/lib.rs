//! Runtime-agnostic command execution library
//!
//! This crate runs commands locally or on remote hosts over SSH and exposes
//! both through the [`Shell`] trait: run-to-completion with captured output,
//! long-running processes with streamed output, file copies and a
//! connectivity self-test.

#![warn(missing_docs)]

pub mod backends;
pub mod command;
pub mod error;
pub mod event;
pub mod launcher;
pub mod process;
pub mod shell;

pub use backends::ssh::{SshConfig, shell_escape};
pub use command::Command;
pub use error::{Error, Result};
pub use event::{ProcessEvent, ProcessEventType};
pub use launcher::Launcher;
pub use process::{ExitResult, ExitStatus, ProcessHandle};
pub use shell::{EventStream, LocalShell, Shell, SpawnedProcess, SshShell};
