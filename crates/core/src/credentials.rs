//! IAM credentials injected into every local container

use crate::errors::{LocalRunError, Result};
use async_trait::async_trait;
use std::fmt;

pub const ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const REGION: &str = "AWS_REGION";

/// Credentials and region of the current session
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"****")
            .field("session_token", &self.session_token.as_ref().map(|_| "****"))
            .field("region", &self.region)
            .finish()
    }
}

impl Credentials {
    /// The identity variables every container receives
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ACCESS_KEY_ID, self.access_key_id.clone()),
            (SECRET_ACCESS_KEY, self.secret_access_key.clone()),
            (SESSION_TOKEN, self.session_token.clone().unwrap_or_default()),
        ];
        if let Some(region) = &self.region {
            vars.push((DEFAULT_REGION, region.clone()));
            vars.push((REGION, region.clone()));
        }
        vars
    }

    /// True for variable names seeded from the session identity
    pub fn is_identity_var(name: &str) -> bool {
        matches!(
            name,
            ACCESS_KEY_ID | SECRET_ACCESS_KEY | SESSION_TOKEN | DEFAULT_REGION | REGION
        )
    }
}

/// Source of session credentials
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn get(&self) -> Result<Credentials>;
}

/// Reads credentials from the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    /// True when the environment carries a key pair
    pub fn available() -> bool {
        std::env::var_os(ACCESS_KEY_ID).is_some() && std::env::var_os(SECRET_ACCESS_KEY).is_some()
    }
}

/// Region from `AWS_REGION`, falling back to `AWS_DEFAULT_REGION`
pub fn region_from_env() -> Option<String> {
    std::env::var(REGION)
        .or_else(|_| std::env::var(DEFAULT_REGION))
        .ok()
        .filter(|r| !r.is_empty())
}

#[async_trait]
impl CredentialsProvider for EnvCredentials {
    async fn get(&self) -> Result<Credentials> {
        let required = |name: &str| {
            std::env::var(name).map_err(|_| LocalRunError::Credentials {
                message: format!("{} is not set", name),
            })
        };
        Ok(Credentials {
            access_key_id: required(ACCESS_KEY_ID)?,
            secret_access_key: required(SECRET_ACCESS_KEY)?,
            session_token: std::env::var(SESSION_TOKEN).ok(),
            region: region_from_env(),
        })
    }
}
