//! Launcher trait for executing commands in different contexts

use crate::command::Command;
use crate::error::Result;
use crate::event::{ProcessEvent, ProcessEventType};
use crate::process::{ExitResult, ProcessHandle};
use async_trait::async_trait;
use futures::stream::Stream;

/// A launcher that can execute commands in a specific context
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// The event stream type this launcher produces
    type EventStream: Stream<Item = ProcessEvent> + Send + Unpin + 'static;

    /// The process handle type this launcher produces
    type Handle: ProcessHandle + 'static;

    /// Launch a command, returning event stream and control handle
    async fn launch(&self, command: Command) -> Result<(Self::EventStream, Self::Handle)>;

    /// Execute a command and wait for it to complete, capturing output
    async fn execute(&self, command: Command) -> Result<ExitResult> {
        use futures::StreamExt;

        let (mut events, mut handle) = self.launch(command).await?;
        let mut output = String::new();
        let mut stdout = String::new();
        let mut stderr = String::new();

        while let Some(event) = events.next().await {
            let Some(data) = &event.data else { continue };
            let split = match event.event_type {
                ProcessEventType::Stdout => &mut stdout,
                ProcessEventType::Stderr => &mut stderr,
                ProcessEventType::Started { .. } => continue,
            };
            split.push_str(data);
            split.push('\n');
            output.push_str(data);
            output.push('\n');
        }

        let status = handle.wait().await?;
        Ok(ExitResult {
            status,
            output,
            stdout,
            stderr,
        })
    }
}
