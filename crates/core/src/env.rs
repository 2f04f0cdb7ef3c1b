//! Per-container environment construction
//!
//! Precedence, lowest to highest: session identity, task-definition
//! variables, secrets, operator overrides. Overrides are applied before
//! secrets are registered so that an overridden secret is never fetched on
//! its account.

use crate::credentials::Credentials;
use crate::errors::{ConfigError, Result};
use crate::secrets::{SecretReference, SecretResolver};
use crate::task::TaskDescriptor;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use tracing::{debug, instrument, warn};

/// Resolved value of one variable in one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVarValue {
    pub value: String,
    pub is_secret: bool,
    pub is_override: bool,
}

impl EnvVarValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_secret: true,
            is_override: false,
        }
    }

    pub fn overridden(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_secret: false,
            is_override: true,
        }
    }
}

/// Variables of a single container
pub type ContainerEnv = HashMap<String, EnvVarValue>;

/// Variables for every container of the task definition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerEnvironment {
    containers: HashMap<String, ContainerEnv>,
}

impl ContainerEnvironment {
    pub fn container(&self, name: &str) -> Option<&ContainerEnv> {
        self.containers.get(name)
    }

    pub fn get(&self, container: &str, key: &str) -> Option<&EnvVarValue> {
        self.containers.get(container)?.get(key)
    }

    pub fn container_names(&self) -> impl Iterator<Item = &str> {
        self.containers.keys().map(String::as_str)
    }

    /// Plain and secret maps for one container, ready for a run specification
    pub fn split(&self, container: &str) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut plain = BTreeMap::new();
        let mut secret = BTreeMap::new();
        for (key, var) in self.containers.get(container).into_iter().flatten() {
            if var.is_secret {
                secret.insert(key.clone(), var.value.clone());
            } else {
                plain.insert(key.clone(), var.value.clone());
            }
        }
        (plain, secret)
    }
}

impl From<HashMap<String, ContainerEnv>> for ContainerEnvironment {
    fn from(containers: HashMap<String, ContainerEnv>) -> Self {
        Self { containers }
    }
}

/// Operator override in `[container:]KEY=VALUE` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOverride {
    /// `None` applies to every container
    pub container: Option<String>,
    pub key: String,
    pub value: String,
}

impl EnvOverride {
    pub fn parse(raw: &str) -> std::result::Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEnvOverride {
            value: raw.to_string(),
            reason: reason.to_string(),
        };

        let (target, value) = raw
            .split_once('=')
            .ok_or_else(|| invalid("expected [container:]KEY=VALUE"))?;

        let (container, key) = match target.split_once(':') {
            Some((container, key)) => {
                if container.is_empty() {
                    return Err(invalid("empty container name"));
                }
                (Some(container.to_string()), key)
            }
            None => (None, target),
        };
        if key.is_empty() {
            return Err(invalid("empty variable name"));
        }

        Ok(Self {
            container,
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// The key as the operator wrote it, including any container prefix
    pub fn target(&self) -> String {
        match &self.container {
            Some(container) => format!("{}:{}", container, self.key),
            None => self.key.clone(),
        }
    }
}

impl FromStr for EnvOverride {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Merges identity, declared variables, overrides and secrets
#[derive(Debug)]
pub struct EnvironmentBuilder<'a> {
    descriptor: &'a TaskDescriptor,
    credentials: &'a Credentials,
    overrides: &'a [EnvOverride],
}

impl<'a> EnvironmentBuilder<'a> {
    pub fn new(
        descriptor: &'a TaskDescriptor,
        credentials: &'a Credentials,
        overrides: &'a [EnvOverride],
    ) -> Self {
        Self {
            descriptor,
            credentials,
            overrides,
        }
    }

    /// Build the environment without touching any secret store.
    ///
    /// Secrets are left as placeholders holding their reference; the returned
    /// set lists the distinct references still to fetch.
    pub fn prepare(&self) -> Result<(ContainerEnvironment, HashSet<SecretReference>)> {
        let mut env = self.seed();
        self.apply_declared(&mut env);
        self.apply_overrides(&mut env)?;
        let pending = self.register_secrets(&mut env)?;
        Ok((env, pending))
    }

    /// Build the complete environment, resolving secrets through `resolver`
    #[instrument(skip_all)]
    pub async fn build(&self, resolver: &SecretResolver) -> Result<ContainerEnvironment> {
        let (mut env, pending) = self.prepare()?;
        debug!("Resolving {} distinct secret references", pending.len());
        let resolved = resolver.resolve(pending).await?;
        fill_secrets(&mut env, &resolved);
        Ok(env)
    }

    fn seed(&self) -> ContainerEnvironment {
        let identity = self.credentials.env_vars();
        let containers = self
            .descriptor
            .containers()
            .iter()
            .map(|c| {
                let vars = identity
                    .iter()
                    .map(|(k, v)| (k.to_string(), EnvVarValue::plain(v.clone())))
                    .collect();
                (c.name.clone(), vars)
            })
            .collect();
        ContainerEnvironment { containers }
    }

    fn apply_declared(&self, env: &mut ContainerEnvironment) {
        for var in self.descriptor.environment_variables() {
            if Credentials::is_identity_var(var.name) {
                warn!(
                    "Ignoring {} declared by container {}; session credentials take precedence",
                    var.name, var.container
                );
                continue;
            }
            if let Some(vars) = env.containers.get_mut(var.container) {
                vars.insert(var.name.to_string(), EnvVarValue::plain(var.value));
            }
        }
    }

    fn apply_overrides(&self, env: &mut ContainerEnvironment) -> Result<()> {
        for item in self.overrides {
            match &item.container {
                None => {
                    for vars in env.containers.values_mut() {
                        vars.insert(item.key.clone(), EnvVarValue::overridden(&item.value));
                    }
                }
                Some(container) => {
                    let vars = env.containers.get_mut(container).ok_or_else(|| {
                        ConfigError::UnknownContainer {
                            key: item.target(),
                            container: container.clone(),
                        }
                    })?;
                    vars.insert(item.key.clone(), EnvVarValue::overridden(&item.value));
                }
            }
        }
        Ok(())
    }

    fn register_secrets(
        &self,
        env: &mut ContainerEnvironment,
    ) -> Result<HashSet<SecretReference>> {
        let mut pending = HashSet::new();
        for secret in self.descriptor.secrets() {
            let Some(vars) = env.containers.get_mut(secret.container) else {
                continue;
            };
            match vars.get(secret.name) {
                Some(existing) if existing.is_override => {
                    debug!(
                        "Secret {} in {} is overridden; skipping",
                        secret.name, secret.container
                    );
                    continue;
                }
                Some(_) => {
                    return Err(ConfigError::DuplicateSecret {
                        container: secret.container.to_string(),
                        name: secret.name.to_string(),
                    }
                    .into());
                }
                None => {}
            }
            vars.insert(secret.name.to_string(), EnvVarValue::secret(secret.value));
            pending.insert(SecretReference::from(secret.value));
        }
        Ok(pending)
    }
}

/// Replace secret placeholders with their resolved values
fn fill_secrets(env: &mut ContainerEnvironment, resolved: &HashMap<SecretReference, String>) {
    for vars in env.containers.values_mut() {
        for var in vars.values_mut().filter(|v| v.is_secret) {
            if let Some(value) = resolved.get(&SecretReference::new(var.value.as_str())) {
                var.value = value.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::mock::MockSecretGetter;
    use crate::task::{ContainerSpec, EnvironmentVariable, SecretDeclaration};
    use std::sync::Arc;

    fn container(name: &str, env: &[(&str, &str)], secrets: &[(&str, &str)]) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: format!("{}:latest", name),
            environment: env
                .iter()
                .map(|(n, v)| EnvironmentVariable {
                    name: n.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            secrets: secrets
                .iter()
                .map(|(n, r)| SecretDeclaration {
                    name: n.to_string(),
                    value_from: r.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn creds() -> Credentials {
        Credentials {
            access_key_id: "AKID".to_string(),
            secret_access_key: "SECRET".to_string(),
            session_token: Some("TOKEN".to_string()),
            region: Some("us-west-2".to_string()),
        }
    }

    fn overrides(values: &[&str]) -> Vec<EnvOverride> {
        values.iter().map(|v| EnvOverride::parse(v).unwrap()).collect()
    }

    #[test]
    fn test_parse_env_override() {
        let o = EnvOverride::parse("FOO=bar").unwrap();
        assert_eq!(o.container, None);
        assert_eq!(o.key, "FOO");
        assert_eq!(o.value, "bar");

        let o = EnvOverride::parse("web:FOO=a=b").unwrap();
        assert_eq!(o.container.as_deref(), Some("web"));
        assert_eq!(o.key, "FOO");
        assert_eq!(o.value, "a=b");
        assert_eq!(o.target(), "web:FOO");

        let o = EnvOverride::parse("EMPTY=").unwrap();
        assert_eq!(o.value, "");

        assert!(EnvOverride::parse("FOO").is_err());
        assert!(EnvOverride::parse("=bar").is_err());
        assert!(EnvOverride::parse(":FOO=bar").is_err());
        assert!(EnvOverride::parse("web:=bar").is_err());
    }

    #[test]
    fn test_identity_seeded_in_every_container() {
        let task = TaskDescriptor::new(vec![
            container("web", &[("AWS_REGION", "eu-central-1")], &[]),
            container("worker", &[], &[]),
        ]);
        let creds = creds();
        let (env, pending) = EnvironmentBuilder::new(&task, &creds, &[]).prepare().unwrap();
        assert!(pending.is_empty());
        for name in ["web", "worker"] {
            assert_eq!(env.get(name, "AWS_ACCESS_KEY_ID").unwrap().value, "AKID");
            assert_eq!(env.get(name, "AWS_REGION").unwrap().value, "us-west-2");
            assert!(!env.get(name, "AWS_SESSION_TOKEN").unwrap().is_secret);
        }
    }

    #[test]
    fn test_global_override_applies_everywhere() {
        let task = TaskDescriptor::new(vec![
            container("web", &[("LOG_LEVEL", "info")], &[]),
            container("worker", &[], &[]),
        ]);
        let creds = creds();
        let overrides = overrides(&["LOG_LEVEL=debug"]);
        let (env, _) = EnvironmentBuilder::new(&task, &creds, &overrides)
            .prepare()
            .unwrap();
        for name in ["web", "worker"] {
            let var = env.get(name, "LOG_LEVEL").unwrap();
            assert_eq!(var.value, "debug");
            assert!(var.is_override);
            assert!(!var.is_secret);
        }
    }

    #[test]
    fn test_scoped_override_only_touches_its_container() {
        let task = TaskDescriptor::new(vec![container("web", &[], &[]), container("worker", &[], &[])]);
        let creds = creds();
        let overrides = overrides(&["worker:QUEUE=jobs"]);
        let (env, _) = EnvironmentBuilder::new(&task, &creds, &overrides)
            .prepare()
            .unwrap();
        assert!(env.get("web", "QUEUE").is_none());
        assert_eq!(env.get("worker", "QUEUE").unwrap().value, "jobs");
    }

    #[test]
    fn test_override_for_unknown_container_fails() {
        let task = TaskDescriptor::new(vec![container("web", &[], &[])]);
        let creds = creds();
        let overrides = overrides(&["db:PASSWORD=x"]);
        let err = EnvironmentBuilder::new(&task, &creds, &overrides)
            .prepare()
            .unwrap_err();
        assert!(err.to_string().contains("targets invalid container"));
    }

    #[test]
    fn test_duplicate_secret_and_variable_fails() {
        let task = TaskDescriptor::new(vec![container(
            "web",
            &[("TOKEN", "plain")],
            &[("TOKEN", "/app/token")],
        )]);
        let creds = creds();
        let err = EnvironmentBuilder::new(&task, &creds, &[])
            .prepare()
            .unwrap_err();
        assert!(err.to_string().contains("secret names must be unique"));
    }

    #[test]
    fn test_overridden_secret_is_not_fetched() {
        let task = TaskDescriptor::new(vec![container(
            "web",
            &[("TOKEN", "plain")],
            &[("TOKEN", "/app/token")],
        )]);
        let creds = creds();
        let overrides = overrides(&["web:TOKEN=local"]);
        let (env, pending) = EnvironmentBuilder::new(&task, &creds, &overrides)
            .prepare()
            .unwrap();
        assert!(pending.is_empty());
        let var = env.get("web", "TOKEN").unwrap();
        assert_eq!(var.value, "local");
        assert!(var.is_override);
    }

    #[tokio::test]
    async fn test_shared_reference_fetched_once() {
        let task = TaskDescriptor::new(vec![
            container("web", &[], &[("DB_PASSWORD", "/app/db"), ("API_KEY", "/app/api")]),
            container("worker", &[], &[("PASSWORD", "/app/db")]),
        ]);
        let creds = creds();
        let getter = Arc::new(
            MockSecretGetter::new()
                .with_value("/app/db", "hunter2")
                .with_value("/app/api", "key"),
        );
        let resolver = SecretResolver::new(getter.clone(), getter.clone());

        let env = EnvironmentBuilder::new(&task, &creds, &[])
            .build(&resolver)
            .await
            .unwrap();

        assert_eq!(getter.call_count(), 2);
        assert_eq!(env.get("web", "DB_PASSWORD").unwrap().value, "hunter2");
        assert_eq!(env.get("worker", "PASSWORD").unwrap().value, "hunter2");
        assert!(env.get("worker", "PASSWORD").unwrap().is_secret);
    }

    #[tokio::test]
    async fn test_override_and_shared_secret() {
        let task = TaskDescriptor::new(vec![
            container("web", &[], &[("DB_PASSWORD", "/app/db")]),
            container("worker", &[], &[("DB_PASSWORD", "/app/db")]),
        ]);
        let creds = creds();
        let overrides = overrides(&["web:DB_PASSWORD=local"]);
        let getter = Arc::new(MockSecretGetter::new().with_value("/app/db", "remote"));
        let resolver = SecretResolver::new(getter.clone(), getter.clone());

        let env = EnvironmentBuilder::new(&task, &creds, &overrides)
            .build(&resolver)
            .await
            .unwrap();

        assert_eq!(getter.call_count(), 1);
        assert_eq!(env.get("web", "DB_PASSWORD").unwrap().value, "local");
        assert_eq!(env.get("worker", "DB_PASSWORD").unwrap().value, "remote");
    }

    #[tokio::test]
    async fn test_secret_failure_is_fatal() {
        let task = TaskDescriptor::new(vec![container("web", &[], &[("TOKEN", "/app/token")])]);
        let creds = creds();
        let getter = Arc::new(MockSecretGetter::new().with_failure("/app/token"));
        let resolver = SecretResolver::new(getter.clone(), getter);

        let err = EnvironmentBuilder::new(&task, &creds, &[])
            .build(&resolver)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/app/token"));
    }

    #[test]
    fn test_split_separates_secrets() {
        let task = TaskDescriptor::new(vec![container(
            "web",
            &[("PLAIN", "1")],
            &[("HIDDEN", "/app/hidden")],
        )]);
        let creds = creds();
        let (env, _) = EnvironmentBuilder::new(&task, &creds, &[]).prepare().unwrap();
        let (plain, secret) = env.split("web");
        assert_eq!(plain.get("PLAIN").map(String::as_str), Some("1"));
        assert!(secret.contains_key("HIDDEN"));
        assert!(!plain.contains_key("HIDDEN"));
    }
}
