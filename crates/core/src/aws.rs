//! AWS collaborators backed by the `aws` CLI
//!
//! Task definitions, SSM parameters, Secrets Manager secrets and session
//! credentials are all read by shelling out, the same way containers are driven
//! through the docker/podman CLI.

use crate::credentials::{region_from_env, Credentials, CredentialsProvider};
use crate::errors::{AwsError, LocalRunError, Result, SecretError};
use crate::secrets::SecretGetter;
use crate::task::{TaskDescriptor, TaskDescriptorProvider};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Thin client over the `aws` executable
#[derive(Debug, Clone)]
pub struct AwsCli {
    aws_path: String,
    region: Option<String>,
}

impl AwsCli {
    pub fn new() -> Self {
        Self::with_aws_path("aws".to_string())
    }

    pub fn with_aws_path(aws_path: String) -> Self {
        Self {
            aws_path,
            region: None,
        }
    }

    /// Pass `--region` on every call
    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn aws_path(&self) -> &str {
        &self.aws_path
    }

    /// Task definition family of a deployed workload
    pub fn task_family(app: &str, env: &str, workload: &str) -> String {
        format!("{}-{}-{}", app, env, workload)
    }

    /// Getter for SSM Parameter Store references
    pub fn parameter_store(&self) -> ParameterStore {
        ParameterStore { cli: self.clone() }
    }

    /// Getter for Secrets Manager references
    pub fn secrets_manager(&self) -> SecretsManager {
        SecretsManager { cli: self.clone() }
    }

    /// Run the CLI and return stdout with the trailing newline removed
    async fn output(&self, args: &[&str]) -> std::result::Result<String, AwsError> {
        let mut cmd = Command::new(&self.aws_path);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.args(args);
        if let Some(region) = &self.region {
            cmd.args(["--region", region.as_str()]);
        }
        debug!("Executing AWS command: {} {}", self.aws_path, args.join(" "));

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AwsError::NotInstalled,
                _ => AwsError::CLIError(format!("Failed to execute AWS CLI: {}", e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AwsError::CLIError(stderr.trim().to_string()));
        }
        Ok(strip_newline(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

impl Default for AwsCli {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_newline(mut text: String) -> String {
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}

#[async_trait]
impl TaskDescriptorProvider for AwsCli {
    #[instrument(skip(self))]
    async fn get(&self, app: &str, env: &str, workload: &str) -> Result<TaskDescriptor> {
        let family = Self::task_family(app, env, workload);
        let raw = self
            .output(&[
                "ecs",
                "describe-task-definition",
                "--task-definition",
                &family,
                "--output",
                "json",
            ])
            .await?;
        Ok(TaskDescriptor::from_json(&raw)?)
    }
}

/// Output of `aws configure export-credentials --format process`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessCredentials {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
}

fn parse_process_credentials(raw: &str) -> std::result::Result<ProcessCredentials, AwsError> {
    serde_json::from_str(raw).map_err(|e| AwsError::Parse(format!("export-credentials: {}", e)))
}

#[async_trait]
impl CredentialsProvider for AwsCli {
    #[instrument(skip(self))]
    async fn get(&self) -> Result<Credentials> {
        let raw = self
            .output(&["configure", "export-credentials", "--format", "process"])
            .await
            .map_err(|e| LocalRunError::Credentials {
                message: e.to_string(),
            })?;
        let exported = parse_process_credentials(&raw)?;

        let region = match self.region.clone().or_else(region_from_env) {
            Some(region) => Some(region),
            // An unset region makes `configure get` exit non-zero
            None => self
                .output(&["configure", "get", "region"])
                .await
                .ok()
                .filter(|r| !r.is_empty()),
        };

        Ok(Credentials {
            access_key_id: exported.access_key_id,
            secret_access_key: exported.secret_access_key,
            session_token: exported.session_token,
            region,
        })
    }
}

/// SSM Parameter Store getter
#[derive(Debug, Clone)]
pub struct ParameterStore {
    cli: AwsCli,
}

#[async_trait]
impl SecretGetter for ParameterStore {
    async fn get_value(&self, reference: &str) -> std::result::Result<String, SecretError> {
        Ok(self
            .cli
            .output(&[
                "ssm",
                "get-parameter",
                "--name",
                reference,
                "--with-decryption",
                "--query",
                "Parameter.Value",
                "--output",
                "text",
            ])
            .await?)
    }
}

/// Secrets Manager getter
#[derive(Debug, Clone)]
pub struct SecretsManager {
    cli: AwsCli,
}

#[async_trait]
impl SecretGetter for SecretsManager {
    async fn get_value(&self, reference: &str) -> std::result::Result<String, SecretError> {
        Ok(self
            .cli
            .output(&[
                "secretsmanager",
                "get-secret-value",
                "--secret-id",
                reference,
                "--query",
                "SecretString",
                "--output",
                "text",
            ])
            .await?)
    }
}
