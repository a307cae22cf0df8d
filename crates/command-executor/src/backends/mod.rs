//! Launcher implementations for different execution contexts
//!
//! Launchers compose: `SudoLauncher<SshLauncher<LocalLauncher>>` runs a
//! command under `sudo -n` on a remote host by spawning a local `ssh` client.

pub mod local;
pub mod ssh;
pub mod sudo;

pub use local::{LocalLauncher, LocalProcessHandle, ProcessEventStream};
pub use ssh::{SshConfig, SshLauncher};
pub use sudo::SudoLauncher;
