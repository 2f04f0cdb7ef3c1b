//! Run configuration
//!
//! Values come from CLI flags first, then `LOCALRUN_*` environment variables,
//! then built-in defaults.

use crate::runtime::{RuntimeFactory, RuntimeKind};
use std::time::Duration;
use tracing::warn;

/// Image used for the network anchor container
pub const DEFAULT_PAUSE_IMAGE: &str = "public.ecr.aws/amazonlinux/amazonlinux:2023";
/// Delay between pause-container liveness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// AWS CLI binary
pub const DEFAULT_AWS_PATH: &str = "aws";

pub const PAUSE_IMAGE_ENV: &str = "LOCALRUN_PAUSE_IMAGE";
pub const POLL_INTERVAL_ENV: &str = "LOCALRUN_POLL_INTERVAL_MS";
pub const AWS_PATH_ENV: &str = "LOCALRUN_AWS_PATH";

/// Settings that shape a local run but are not part of the workload itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLocalConfig {
    pub pause_image: String,
    pub poll_interval: Duration,
    pub aws_path: String,
    pub runtime: RuntimeKind,
}

impl Default for RunLocalConfig {
    fn default() -> Self {
        Self {
            pause_image: DEFAULT_PAUSE_IMAGE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            aws_path: DEFAULT_AWS_PATH.to_string(),
            runtime: RuntimeKind::Docker,
        }
    }
}

impl RunLocalConfig {
    /// Defaults overlaid with environment variables, then the CLI runtime flag
    pub fn from_env(cli_runtime: Option<RuntimeKind>) -> Self {
        let defaults = Self::default();
        let poll_interval = match std::env::var(POLL_INTERVAL_ENV) {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    warn!(
                        "Invalid {} value '{}', using {:?}",
                        POLL_INTERVAL_ENV, raw, defaults.poll_interval
                    );
                    defaults.poll_interval
                }
            },
            Err(_) => defaults.poll_interval,
        };

        Self {
            pause_image: non_empty_env(PAUSE_IMAGE_ENV).unwrap_or(defaults.pause_image),
            poll_interval,
            aws_path: non_empty_env(AWS_PATH_ENV).unwrap_or(defaults.aws_path),
            runtime: RuntimeFactory::detect_runtime(cli_runtime),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
