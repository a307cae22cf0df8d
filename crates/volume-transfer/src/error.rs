//! Error types for volume transfer orchestration

use std::fmt;
use thiserror::Error;

use crate::cloud::CloudError;

/// Stage of a migration, reported with the error that stopped it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Conversion host connectivity self-test
    SelfTest,
    /// Source VM power state check
    Precondition,
    /// Discovery of the VM's attached volumes
    Discover,
    /// Comparison with the expected volume set
    Validate,
    /// Boot disk substitution and data volume detach
    PrepareVolumes,
    /// Attach to the source conversion host
    AttachSource,
    /// NBD export start and readiness
    Export,
    /// SSH tunnel setup on the destination conversion host
    Forward,
    /// Destination volume creation
    CreateVolumes,
    /// Attach to the destination conversion host
    AttachDestination,
    /// Block copy
    Convert,
    /// Detach from the destination conversion host
    DetachDestination,
}

impl Stage {
    /// Short stage name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SelfTest => "self-test",
            Stage::Precondition => "precondition",
            Stage::Discover => "discover",
            Stage::Validate => "validate",
            Stage::PrepareVolumes => "prepare-volumes",
            Stage::AttachSource => "attach-source",
            Stage::Export => "export",
            Stage::Forward => "forward",
            Stage::CreateVolumes => "create-volumes",
            Stage::AttachDestination => "attach-destination",
            Stage::Convert => "convert",
            Stage::DetachDestination => "detach-destination",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume transfer error type
#[derive(Error, Debug)]
pub enum Error {
    /// External state the caller has to fix before retrying
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Observed state that cannot be mapped unambiguously
    #[error("Inconsistency: {0}")]
    Inconsistency(String),

    /// Every port in the range is claimed or busy
    #[error("No free port in range {start}-{end}")]
    PortsExhausted {
        /// First port of the range
        start: u16,
        /// Last port of the range
        end: u16,
    },

    /// A required tool is not installed on the host
    #[error("None of the required tools is available on {host}: {tools}")]
    ToolUnavailable {
        /// Host that was checked
        host: String,
        /// Tools that were looked for
        tools: String,
    },

    /// Lock could not be taken within the ceiling
    #[error("Timed out after {waited_secs}s waiting for lock {path} on {host}")]
    LockTimeout {
        /// Host holding the lock file
        host: String,
        /// Lock file path
        path: String,
        /// Seconds spent waiting
        waited_secs: u64,
    },

    /// A polled condition did not hold within the ceiling
    #[error("Timed out after {waited_secs}s waiting for {what}")]
    Timeout {
        /// What was waited for
        what: String,
        /// Seconds spent waiting
        waited_secs: u64,
    },

    /// A remote tool exited unsuccessfully
    #[error("{what} failed on {host} with exit code {code:?}:\n{output}")]
    CommandFailed {
        /// Operation that failed
        what: String,
        /// Host it ran on
        host: String,
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// Output captured from the tool
        output: String,
    },

    /// Cloud API errors
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// Command execution errors
    #[error("Command execution error: {0}")]
    Shell(#[from] command_executor::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more cleanup steps failed
    #[error("Cleanup failed for {} step(s): {}", failures.len(), failures.join("; "))]
    Cleanup {
        /// Description of each failed step
        failures: Vec<String>,
    },

    /// An error annotated with the migration stage it stopped
    #[error("Stage {stage} failed: {source}")]
    Stage {
        /// Stage that failed
        stage: Stage,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Annotate the error with the stage it occurred in
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error stopped, if annotated
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The error without its stage annotation
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the root error is a cloud "not found"
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::Cloud(CloudError::NotFound { .. }))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_annotation_is_not_nested() {
        let err = Error::Inconsistency("two new devices".into())
            .in_stage(Stage::AttachSource)
            .in_stage(Stage::Export);

        assert_eq!(err.stage(), Some(Stage::AttachSource));
        assert!(matches!(err.root(), Error::Inconsistency(_)));
        assert!(err.to_string().contains("attach-source"));
    }

    #[test]
    fn test_not_found_through_stage() {
        let err = Error::from(CloudError::NotFound {
            kind: "volume",
            id: "v1".into(),
        })
        .in_stage(Stage::Discover);
        assert!(err.is_not_found());
    }
}
