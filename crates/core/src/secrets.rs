//! Secret reference classification and resolution
//!
//! A secret reference is either a full ARN or a bare SSM parameter name. ARNs
//! are dispatched by service to the parameter store or the secrets vault; bare
//! names always go to the parameter store.
//!
//! [`SecretResolver::resolve`] fetches every distinct reference exactly once,
//! all concurrently. The first failure aborts the remaining fetches and the
//! whole resolution fails; partial results are discarded.

use crate::errors::SecretError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, instrument};

const SSM_SERVICE: &str = "ssm";
const SECRETS_MANAGER_SERVICE: &str = "secretsmanager";

/// Components of an `arn:partition:service:region:account:resource` identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arn<'a> {
    pub partition: &'a str,
    pub service: &'a str,
    pub region: &'a str,
    pub account_id: &'a str,
    pub resource: &'a str,
}

impl<'a> Arn<'a> {
    /// Parse an ARN; the resource section may itself contain `:`
    pub fn parse(raw: &'a str) -> Option<Self> {
        let mut sections = raw.splitn(6, ':');
        if sections.next()? != "arn" {
            return None;
        }
        Some(Self {
            partition: sections.next()?,
            service: sections.next()?,
            region: sections.next()?,
            account_id: sections.next()?,
            resource: sections.next()?,
        })
    }
}

/// Opaque pointer to a value in a backing store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretReference(String);

impl SecretReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pick the backing store for this reference
    pub fn backend(&self) -> Result<SecretBackend, SecretError> {
        match Arn::parse(&self.0) {
            None => Ok(SecretBackend::ParameterStore),
            Some(arn) if arn.service == SSM_SERVICE => Ok(SecretBackend::ParameterStore),
            Some(arn) if arn.service == SECRETS_MANAGER_SERVICE => {
                Ok(SecretBackend::SecretsManager)
            }
            Some(_) => Err(SecretError::UnsupportedBackend {
                reference: self.0.clone(),
            }),
        }
    }
}

impl fmt::Display for SecretReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SecretReference {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Backing store selected for a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretBackend {
    ParameterStore,
    SecretsManager,
}

/// Fetches one value from a single backing store
#[async_trait]
pub trait SecretGetter: Send + Sync {
    async fn get_value(&self, reference: &str) -> Result<String, SecretError>;
}

/// Resolves sets of references against the two backing stores
#[derive(Clone)]
pub struct SecretResolver {
    parameters: Arc<dyn SecretGetter>,
    vault: Arc<dyn SecretGetter>,
}

impl fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretResolver").finish_non_exhaustive()
    }
}

impl SecretResolver {
    pub fn new(parameters: Arc<dyn SecretGetter>, vault: Arc<dyn SecretGetter>) -> Self {
        Self { parameters, vault }
    }

    fn getter_for(&self, reference: &SecretReference) -> Result<Arc<dyn SecretGetter>, SecretError> {
        Ok(match reference.backend()? {
            SecretBackend::ParameterStore => Arc::clone(&self.parameters),
            SecretBackend::SecretsManager => Arc::clone(&self.vault),
        })
    }

    /// Fetch every reference once and return the value for each reference
    #[instrument(skip_all, fields(references = references.len()))]
    pub async fn resolve(
        &self,
        references: HashSet<SecretReference>,
    ) -> Result<HashMap<SecretReference, String>, SecretError> {
        let resolved = Arc::new(Mutex::new(HashMap::with_capacity(references.len())));
        let mut fetches = JoinSet::new();

        for reference in references {
            let resolved = Arc::clone(&resolved);
            let getter = match self.getter_for(&reference) {
                Ok(getter) => getter,
                Err(e) => {
                    fetches.abort_all();
                    return Err(fetch_error(&reference, e));
                }
            };
            fetches.spawn(async move {
                debug!("Fetching secret {}", reference);
                let value = getter
                    .get_value(reference.as_str())
                    .await
                    .map_err(|e| fetch_error(&reference, e))?;
                resolved
                    .lock()
                    .map_err(|e| SecretError::Join(e.to_string()))?
                    .insert(reference, value);
                Ok::<(), SecretError>(())
            });
        }

        while let Some(joined) = fetches.join_next().await {
            let outcome = joined
                .map_err(|e| SecretError::Join(e.to_string()))
                .and_then(|result| result);
            if let Err(e) = outcome {
                fetches.abort_all();
                return Err(e);
            }
        }

        let resolved = Arc::try_unwrap(resolved)
            .map_err(|_| SecretError::Join("secret results still shared".to_string()))?
            .into_inner()
            .map_err(|e| SecretError::Join(e.to_string()))?;
        debug!("Resolved {} secrets", resolved.len());
        Ok(resolved)
    }
}

fn fetch_error(reference: &SecretReference, source: SecretError) -> SecretError {
    SecretError::Fetch {
        reference: reference.to_string(),
        source: Box::new(source),
    }
}

/// In-memory getter for tests
pub mod mock {
    use super::*;
    use crate::errors::AwsError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Returns configured values and records every lookup
    #[derive(Debug, Default)]
    pub struct MockSecretGetter {
        values: Mutex<HashMap<String, String>>,
        failures: Mutex<HashSet<String>>,
        calls: Mutex<Vec<String>>,
        call_count: AtomicUsize,
        completed: AtomicUsize,
        delay: Option<Duration>,
    }

    impl MockSecretGetter {
        pub fn new() -> Self {
            Self::default()
        }

        /// Sleep this long before answering each lookup
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn with_value(self, reference: &str, value: &str) -> Self {
            if let Ok(mut values) = self.values.lock() {
                values.insert(reference.to_string(), value.to_string());
            }
            self
        }

        pub fn with_failure(self, reference: &str) -> Self {
            if let Ok(mut failures) = self.failures.lock() {
                failures.insert(reference.to_string());
            }
            self
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Lookups that ran to completion, successful or not
        pub fn completed_count(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl SecretGetter for MockSecretGetter {
        async fn get_value(&self, reference: &str) -> Result<String, SecretError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(reference.to_string());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.completed.fetch_add(1, Ordering::SeqCst);

            let failing = self
                .failures
                .lock()
                .map(|f| f.contains(reference))
                .unwrap_or(false);
            if failing {
                return Err(AwsError::CLIError(format!("access denied for {}", reference)).into());
            }

            self.values
                .lock()
                .ok()
                .and_then(|values| values.get(reference).cloned())
                .ok_or_else(|| {
                    AwsError::CLIError(format!("parameter {} not found", reference)).into()
                })
        }
    }
}
