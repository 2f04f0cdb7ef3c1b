//! Container runtime selection for Docker/Podman
//!
//! Both runtimes are driven through the same CLI-backed client; only the
//! binary differs.

use crate::docker::CliRuntime;
use crate::errors::LocalRunError;

/// Environment variable consulted when no runtime flag is given
pub const RUNTIME_ENV: &str = "LOCALRUN_RUNTIME";

/// Runtime selection options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeKind {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeKind {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = LocalRunError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            _ => Err(LocalRunError::Internal(format!(
                "Unknown runtime: {}. Supported runtimes: docker, podman",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime factory for creating container runtime instances
pub struct RuntimeFactory;

impl RuntimeFactory {
    /// Detect runtime from CLI flag, environment variable, or default
    ///
    /// Precedence: CLI flag > LOCALRUN_RUNTIME env var > default (docker)
    pub fn detect_runtime(cli_runtime: Option<RuntimeKind>) -> RuntimeKind {
        if let Some(runtime) = cli_runtime {
            return runtime;
        }

        if let Ok(env_runtime) = std::env::var(RUNTIME_ENV) {
            if let Ok(runtime) = env_runtime.parse() {
                return runtime;
            }
        }

        RuntimeKind::Docker
    }

    /// Create the CLI client for a runtime kind
    pub fn create_runtime(kind: RuntimeKind) -> CliRuntime {
        match kind {
            RuntimeKind::Docker => CliRuntime::docker(),
            RuntimeKind::Podman => CliRuntime::podman(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_runtime_kind_parsing() {
        assert_eq!("docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Docker);
        assert_eq!("PODMAN".parse::<RuntimeKind>().unwrap(), RuntimeKind::Podman);
        assert!("containerd".parse::<RuntimeKind>().is_err());
    }

    #[test]
    #[serial]
    fn test_detect_runtime_precedence() {
        std::env::set_var(RUNTIME_ENV, "podman");
        assert_eq!(RuntimeFactory::detect_runtime(None), RuntimeKind::Podman);
        assert_eq!(
            RuntimeFactory::detect_runtime(Some(RuntimeKind::Docker)),
            RuntimeKind::Docker
        );

        std::env::set_var(RUNTIME_ENV, "invalid");
        assert_eq!(RuntimeFactory::detect_runtime(None), RuntimeKind::Docker);
        std::env::remove_var(RUNTIME_ENV);
    }

    #[test]
    fn test_create_runtime() {
        assert_eq!(
            RuntimeFactory::create_runtime(RuntimeKind::Podman).runtime_path(),
            "podman"
        );
    }
}
