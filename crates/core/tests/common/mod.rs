//! Shared test helpers for core integration tests.

#![allow(dead_code)]

use localrun_core::credentials::Credentials;
use localrun_core::docker::mock::MockRuntime;
use localrun_core::env::{EnvOverride, EnvironmentBuilder};
use localrun_core::images::resolve_images;
use localrun_core::orchestrator::{Orchestrator, RunIdentity, RunPlan};
use localrun_core::ports::{PortBindings, PortOverride};
use localrun_core::secrets::SecretResolver;
use localrun_core::task::TaskDescriptor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Task definition with three containers sharing one database secret
pub const TASK_DEFINITION: &str = r#"{
    "taskDefinition": {
        "family": "shop-test-api",
        "containerDefinitions": [
            {
                "name": "web",
                "image": "registry/web:1",
                "portMappings": [{"containerPort": 80, "hostPort": 8080}],
                "environment": [{"name": "LOG_LEVEL", "value": "info"}],
                "secrets": [
                    {"name": "DB_PASSWORD", "valueFrom": "arn:aws:ssm:us-east-1:123456789012:parameter/shop/db"}
                ]
            },
            {
                "name": "worker",
                "image": "registry/worker:1",
                "secrets": [
                    {"name": "DB_PASSWORD", "valueFrom": "arn:aws:ssm:us-east-1:123456789012:parameter/shop/db"},
                    {"name": "API_KEY", "valueFrom": "arn:aws:secretsmanager:us-east-1:123456789012:secret:shop/api"}
                ]
            },
            {
                "name": "db",
                "image": "registry/db:1",
                "portMappings": [{"containerPort": 5432}]
            }
        ]
    }
}"#;

pub fn identity() -> RunIdentity {
    RunIdentity::new("shop", "test", "api")
}

pub fn credentials() -> Credentials {
    Credentials {
        access_key_id: "AKIDEXAMPLE".to_string(),
        secret_access_key: "secret".to_string(),
        session_token: Some("token".to_string()),
        region: Some("us-east-1".to_string()),
    }
}

pub fn descriptor() -> TaskDescriptor {
    TaskDescriptor::from_json(TASK_DEFINITION).expect("valid task definition")
}

/// Resolve a full run plan against mock secret stores
pub async fn plan(
    descriptor: &TaskDescriptor,
    resolver: &SecretResolver,
    ports: &[PortOverride],
    overrides: &[EnvOverride],
) -> RunPlan {
    let creds = credentials();
    let environment = EnvironmentBuilder::new(descriptor, &creds, overrides)
        .build(resolver)
        .await
        .expect("environment builds");
    RunPlan::new(
        PortBindings::resolve(descriptor, ports),
        resolve_images(&HashMap::new(), descriptor),
        environment,
    )
}

pub fn orchestrator(runtime: &Arc<MockRuntime>) -> Orchestrator {
    Orchestrator::new(runtime.clone(), identity()).with_poll_interval(Duration::from_millis(5))
}
