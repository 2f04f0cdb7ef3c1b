//! Error types and handling
//!
//! The taxonomy follows the phases of a local run. Configuration and secret
//! resolution errors abort before any container starts; runtime errors are
//! reported after cleanup; cleanup errors are collected per container and step
//! and surfaced together. All of them are wrapped in [`LocalRunError`].

use std::fmt;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Generic validation failure
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// A required value (application, environment, workload) is missing
    #[error("Missing required value: {what}")]
    Missing { what: String },

    /// An environment override names a container that is not in the task definition
    #[error("{key:?} targets invalid container {container:?}")]
    UnknownContainer { key: String, container: String },

    /// A secret shares its variable name with a plain variable in the same container
    #[error(
        "secret names must be unique, but an environment variable {name:?} already exists in container {container:?}"
    )]
    DuplicateSecret { container: String, name: String },

    /// Malformed `containerPort:hostPort` value
    #[error("Invalid port override {value:?}: {reason}")]
    InvalidPortOverride { value: String, reason: String },

    /// Malformed `[container:]KEY=VALUE` value
    #[error("Invalid environment variable override {value:?}: {reason}")]
    InvalidEnvOverride { value: String, reason: String },

    /// Malformed `name=uri` image value
    #[error("Invalid image override {value:?}: expected NAME=URI")]
    InvalidImageOverride { value: String },

    /// Task definition parsing error
    #[error("Failed to parse task definition: {message}")]
    Parsing { message: String },

    /// Task definition file not found
    #[error("Task definition file not found: {path}")]
    NotFound { path: String },

    /// Task definition I/O error
    #[error("Failed to read task definition file")]
    Io(#[from] std::io::Error),
}

/// Container runtime errors
#[derive(Error, Debug)]
pub enum DockerError {
    /// Runtime binary is not installed or not accessible
    #[error("Container runtime is not installed or not accessible")]
    NotInstalled,

    /// Runtime CLI command error
    #[error("Docker CLI error: {0}")]
    CLIError(String),

    /// Container not found
    #[error("Container not found: {id}")]
    ContainerNotFound { id: String },

    /// `run` returned a non-zero exit status
    #[error("container exited with status {}", describe_exit(.code))]
    ExitStatus { code: Option<i32> },

    /// The run call was cancelled through its token
    #[error("run cancelled")]
    Cancelled,
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// AWS CLI adapter errors
#[derive(Error, Debug)]
pub enum AwsError {
    /// The aws binary is not installed or not accessible
    #[error("AWS CLI is not installed or not accessible")]
    NotInstalled,

    /// The aws command failed
    #[error("AWS CLI error: {0}")]
    CLIError(String),

    /// The aws command output could not be parsed
    #[error("Failed to parse AWS CLI output: {0}")]
    Parse(String),
}

/// Secret resolution errors
#[derive(Error, Debug)]
pub enum SecretError {
    /// A reference parsed as an ARN for a service that does not store secrets
    #[error("invalid ARN {reference:?}; not a SSM or Secrets Manager ARN")]
    UnsupportedBackend { reference: String },

    /// A backing store lookup failed
    #[error("get secret {reference:?}: {source}")]
    Fetch {
        reference: String,
        #[source]
        source: Box<SecretError>,
    },

    /// Backend specific failure
    #[error("{0}")]
    Backend(#[from] AwsError),

    /// Fetch task panicked or was aborted unexpectedly
    #[error("secret fetch task failed: {0}")]
    Join(String),
}

/// Which half of a stop-then-remove pair failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    Stop,
    Remove,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => f.write_str("stop"),
            Self::Remove => f.write_str("rm"),
        }
    }
}

/// A single failed cleanup step for one container
#[derive(Error, Debug)]
#[error("clean up {container:?}: {step}: {source}")]
pub struct CleanupError {
    pub container: String,
    pub step: CleanupStep,
    #[source]
    pub source: DockerError,
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum LocalRunError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Secret resolution errors
    #[error("get secrets: {0}")]
    Secret(#[from] SecretError),

    /// Runtime client errors outside of a specific container run
    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    /// AWS adapter errors
    #[error("AWS error: {0}")]
    Aws(#[from] AwsError),

    /// Credential lookup failed
    #[error("get IAM credentials: {message}")]
    Credentials { message: String },

    /// The pause container failed to start or exited early
    #[error("run pause container: {source}")]
    PauseContainer {
        #[source]
        source: DockerError,
    },

    /// An application container failed
    #[error("run container {name:?}: {source}")]
    Container {
        name: String,
        #[source]
        source: DockerError,
    },

    /// The run phase was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// Run-phase error and/or cleanup errors surfaced together
    #[error("{}", render_aggregate(.run.as_deref(), .cleanup))]
    Aggregate {
        run: Option<Box<LocalRunError>>,
        cleanup: Vec<CleanupError>,
    },

    /// Internal/generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LocalRunError {
    /// True for errors that only exist because a cancellation was requested.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::PauseContainer { source } | Self::Container { source, .. } => {
                matches!(source, DockerError::Cancelled)
            }
            Self::Docker(DockerError::Cancelled) => true,
            _ => false,
        }
    }

    /// Combine a run-phase result with collected cleanup errors.
    ///
    /// Cleanup errors are sorted by message so the output does not depend on
    /// the order in which concurrent cleanups finished.
    pub fn aggregate(run: Option<LocalRunError>, mut cleanup: Vec<CleanupError>) -> Option<Self> {
        match (run, cleanup.is_empty()) {
            (None, true) => None,
            (Some(run), true) => Some(run),
            (run, false) => {
                cleanup.sort_by_cached_key(|e| e.to_string());
                Some(Self::Aggregate {
                    run: run.map(Box::new),
                    cleanup,
                })
            }
        }
    }
}

fn render_aggregate(run: Option<&LocalRunError>, cleanup: &[CleanupError]) -> String {
    run.map(|e| e.to_string())
        .into_iter()
        .chain(cleanup.iter().map(|e| e.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Convenience type alias for Results with LocalRunError
pub type Result<T> = std::result::Result<T, LocalRunError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::UnknownContainer {
            key: "db:PASSWORD".to_string(),
            container: "db".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "\"db:PASSWORD\" targets invalid container \"db\""
        );

        let error = ConfigError::DuplicateSecret {
            container: "web".to_string(),
            name: "TOKEN".to_string(),
        };
        assert!(error.to_string().contains("secret names must be unique"));
    }

    #[test]
    fn test_cleanup_error_display() {
        let error = CleanupError {
            container: "web-app-test-api".to_string(),
            step: CleanupStep::Remove,
            source: DockerError::ContainerNotFound {
                id: "web-app-test-api".to_string(),
            },
        };
        assert_eq!(
            error.to_string(),
            "clean up \"web-app-test-api\": rm: Container not found: web-app-test-api"
        );
    }

    #[test]
    fn test_aggregate_sorts_cleanup_errors() {
        let cleanup = vec![
            CleanupError {
                container: "worker".to_string(),
                step: CleanupStep::Stop,
                source: DockerError::CLIError("boom".to_string()),
            },
            CleanupError {
                container: "api".to_string(),
                step: CleanupStep::Stop,
                source: DockerError::CLIError("boom".to_string()),
            },
        ];
        let run = LocalRunError::Container {
            name: "db".to_string(),
            source: DockerError::ExitStatus { code: Some(1) },
        };

        let err = LocalRunError::aggregate(Some(run), cleanup).unwrap();
        let lines: Vec<String> = err.to_string().lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "run container \"db\": container exited with status 1");
        assert!(lines[1].starts_with("clean up \"api\""));
        assert!(lines[2].starts_with("clean up \"worker\""));
    }

    #[test]
    fn test_aggregate_without_cleanup_errors_keeps_run_error() {
        let err = LocalRunError::aggregate(Some(LocalRunError::Cancelled), vec![]).unwrap();
        assert!(matches!(err, LocalRunError::Cancelled));
        assert!(LocalRunError::aggregate(None, vec![]).is_none());
    }

    #[test]
    fn test_is_cancellation() {
        assert!(LocalRunError::Cancelled.is_cancellation());
        assert!(LocalRunError::Container {
            name: "web".to_string(),
            source: DockerError::Cancelled,
        }
        .is_cancellation());
        assert!(!LocalRunError::Container {
            name: "web".to_string(),
            source: DockerError::ExitStatus { code: Some(2) },
        }
        .is_cancellation());
    }

    #[test]
    fn test_error_source_chain() {
        let inner = SecretError::Backend(AwsError::CLIError("denied".to_string()));
        let err = LocalRunError::Secret(SecretError::Fetch {
            reference: "/app/db".to_string(),
            source: Box::new(inner),
        });
        let source = err.source().unwrap();
        assert!(source.source().is_some());
    }
}
