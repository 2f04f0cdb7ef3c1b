//! Task descriptor model and providers
//!
//! The task descriptor is the remote definition of a workload's containers.
//! It is read in the ECS task-definition JSON shape, either from a local file
//! or through a [`TaskDescriptorProvider`] backed by the AWS CLI.

use crate::errors::{ConfigError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Container port / host port pair as declared by the task definition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    #[serde(default)]
    pub container_port: Option<u16>,
    #[serde(default)]
    pub host_port: Option<u16>,
}

/// Plain environment variable declared on a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Secret declared on a container: target variable name and store reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretDeclaration {
    pub name: String,
    pub value_from: String,
}

/// One container of the task descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub environment: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub secrets: Vec<SecretDeclaration>,
}

/// A declaration flattened together with the container it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerScoped<'a> {
    pub container: &'a str,
    pub name: &'a str,
    pub value: &'a str,
}

/// The containers of one workload, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    #[serde(default)]
    container_definitions: Vec<ContainerSpec>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeTaskDefinitionOutput {
    task_definition: TaskDescriptor,
}

impl TaskDescriptor {
    pub fn new(containers: Vec<ContainerSpec>) -> Self {
        Self {
            container_definitions: containers,
        }
    }

    /// Parse either a bare task definition or the `describe-task-definition` envelope
    pub fn from_json(raw: &str) -> std::result::Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parsing {
                message: e.to_string(),
            })?;

        let descriptor = if value.get("taskDefinition").is_some() {
            serde_json::from_value::<DescribeTaskDefinitionOutput>(value)
                .map(|out| out.task_definition)
        } else {
            serde_json::from_value::<TaskDescriptor>(value)
        }
        .map_err(|e| ConfigError::Parsing {
            message: e.to_string(),
        })?;

        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.container_definitions.is_empty() {
            return Err(ConfigError::Validation {
                message: "task definition has no container definitions".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for container in &self.container_definitions {
            if container.name.is_empty() {
                return Err(ConfigError::Validation {
                    message: "container definition without a name".to_string(),
                });
            }
            if !seen.insert(container.name.as_str()) {
                return Err(ConfigError::Validation {
                    message: format!("duplicate container name {:?}", container.name),
                });
            }
        }
        Ok(())
    }

    pub fn containers(&self) -> &[ContainerSpec] {
        &self.container_definitions
    }

    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.container_definitions.iter().find(|c| c.name == name)
    }

    /// Every declared plain variable, tagged with its container
    pub fn environment_variables(&self) -> impl Iterator<Item = ContainerScoped<'_>> {
        self.container_definitions.iter().flat_map(|c| {
            c.environment.iter().map(move |e| ContainerScoped {
                container: &c.name,
                name: &e.name,
                value: &e.value,
            })
        })
    }

    /// Every declared secret, tagged with its container; `value` is the reference
    pub fn secrets(&self) -> impl Iterator<Item = ContainerScoped<'_>> {
        self.container_definitions.iter().flat_map(|c| {
            c.secrets.iter().map(move |s| ContainerScoped {
                container: &c.name,
                name: &s.name,
                value: &s.value_from,
            })
        })
    }
}

/// Source of task descriptors for a deployed workload
#[async_trait]
pub trait TaskDescriptorProvider: Send + Sync {
    async fn get(&self, app: &str, env: &str, workload: &str) -> Result<TaskDescriptor>;
}

/// Reads a task definition JSON document from disk
#[derive(Debug, Clone)]
pub struct FileTaskDescriptorProvider {
    path: PathBuf,
}

impl FileTaskDescriptorProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TaskDescriptorProvider for FileTaskDescriptorProvider {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn get(&self, app: &str, env: &str, workload: &str) -> Result<TaskDescriptor> {
        if !self.path.exists() {
            return Err(ConfigError::NotFound {
                path: self.path.display().to_string(),
            }
            .into());
        }
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(ConfigError::Io)?;
        let descriptor = TaskDescriptor::from_json(&raw)?;
        debug!(
            "Loaded task definition with {} containers",
            descriptor.containers().len()
        );
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TASK_DEF: &str = r#"{
        "family": "app-test-api",
        "containerDefinitions": [
            {
                "name": "api",
                "image": "123456789012.dkr.ecr.us-west-2.amazonaws.com/app/api:latest",
                "portMappings": [{"containerPort": 80, "hostPort": 80, "protocol": "tcp"}],
                "environment": [{"name": "LOG_LEVEL", "value": "debug"}],
                "secrets": [{"name": "DB_PASSWORD", "valueFrom": "/app/test/db"}]
            },
            {
                "name": "sidecar",
                "image": "public.ecr.aws/nginx/nginx:latest"
            }
        ]
    }"#;

    #[test]
    fn test_from_json_bare() {
        let task = TaskDescriptor::from_json(TASK_DEF).unwrap();
        assert_eq!(task.containers().len(), 2);
        let api = task.container("api").unwrap();
        assert_eq!(api.port_mappings[0].container_port, Some(80));
        assert!(task.container("sidecar").unwrap().secrets.is_empty());
    }

    #[test]
    fn test_from_json_envelope() {
        let wrapped = format!(r#"{{"taskDefinition": {}}}"#, TASK_DEF);
        let task = TaskDescriptor::from_json(&wrapped).unwrap();
        assert_eq!(task.containers()[0].name, "api");
    }

    #[test]
    fn test_flattened_declarations() {
        let task = TaskDescriptor::from_json(TASK_DEF).unwrap();
        let vars: Vec<_> = task.environment_variables().collect();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].container, "api");
        assert_eq!(vars[0].value, "debug");

        let secrets: Vec<_> = task.secrets().collect();
        assert_eq!(secrets[0].name, "DB_PASSWORD");
        assert_eq!(secrets[0].value, "/app/test/db");
    }

    #[test]
    fn test_from_json_rejects_empty_and_duplicates() {
        assert!(TaskDescriptor::from_json(r#"{"containerDefinitions": []}"#).is_err());
        assert!(TaskDescriptor::from_json(
            r#"{"containerDefinitions": [{"name": "a"}, {"name": "a"}]}"#
        )
        .is_err());
        assert!(TaskDescriptor::from_json("not json").is_err());
    }

    #[tokio::test]
    async fn test_file_provider() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TASK_DEF.as_bytes()).unwrap();

        let provider = FileTaskDescriptorProvider::new(file.path());
        let task = provider.get("app", "test", "api").await.unwrap();
        assert_eq!(task.containers().len(), 2);

        let missing = FileTaskDescriptorProvider::new("/definitely/not/here.json");
        let err = missing.get("app", "test", "api").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
