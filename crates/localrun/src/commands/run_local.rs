//! Run command implementation
//!
//! Implements `localrun run`: fetch the workload's task definition, resolve its
//! environment and secrets, and hand the result to the orchestrator.

use anyhow::Result;
use localrun_core::aws::AwsCli;
use localrun_core::cancel::{force_exit, shutdown_signal, spawn_forced_exit};
use localrun_core::config::RunLocalConfig;
use localrun_core::credentials::{region_from_env, CredentialsProvider, EnvCredentials};
use localrun_core::env::{EnvOverride, EnvironmentBuilder};
use localrun_core::errors::{ConfigError, LocalRunError};
use localrun_core::images::resolve_images;
use localrun_core::orchestrator::{Orchestrator, Phase, RunIdentity, RunPlan};
use localrun_core::ports::{PortBindings, PortOverride};
use localrun_core::progress::ProgressEmitter;
use localrun_core::runtime::{RuntimeFactory, RuntimeKind};
use localrun_core::secrets::SecretResolver;
use localrun_core::task::{FileTaskDescriptorProvider, TaskDescriptorProvider};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Run command arguments
pub struct RunLocalArgs {
    pub app: String,
    pub env: String,
    pub workload: String,
    pub port_overrides: Vec<PortOverride>,
    pub env_overrides: Vec<EnvOverride>,
    /// Locally built images by container name
    pub images: HashMap<String, String>,
    /// Local task definition file; the AWS CLI is used when absent
    pub task_definition: Option<PathBuf>,
    pub pause_image: Option<String>,
    pub runtime: Option<RuntimeKind>,
    pub progress: Arc<dyn ProgressEmitter>,
}

impl RunLocalArgs {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (what, value) in [
            ("application name", &self.app),
            ("environment name", &self.env),
            ("workload name", &self.workload),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing {
                    what: what.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Execute the run command
#[instrument(skip_all, fields(app = %args.app, env = %args.env, workload = %args.workload))]
pub async fn execute_run_local(args: RunLocalArgs) -> Result<()> {
    args.validate().map_err(LocalRunError::from)?;

    let config = RunLocalConfig::from_env(args.runtime);
    debug!("Run configuration: {:?}", config);
    let aws = AwsCli::with_aws_path(config.aws_path.clone()).with_region(region_from_env());

    let descriptors: Box<dyn TaskDescriptorProvider> = match &args.task_definition {
        Some(path) => Box::new(FileTaskDescriptorProvider::new(path)),
        None => Box::new(aws.clone()),
    };
    let descriptor = descriptors
        .get(&args.app, &args.env, &args.workload)
        .await?;
    info!(
        "Loaded task definition with {} containers",
        descriptor.containers().len()
    );

    let credentials: Box<dyn CredentialsProvider> = if EnvCredentials::available() {
        Box::new(EnvCredentials)
    } else {
        Box::new(aws.clone())
    };
    let credentials = credentials.get().await?;

    let resolver = SecretResolver::new(
        Arc::new(aws.parameter_store()),
        Arc::new(aws.secrets_manager()),
    );
    let environment = EnvironmentBuilder::new(&descriptor, &credentials, &args.env_overrides)
        .build(&resolver)
        .await?;

    let plan = RunPlan::new(
        PortBindings::resolve(&descriptor, &args.port_overrides),
        resolve_images(&args.images, &descriptor),
        environment,
    );
    for (container, host) in plan.ports.iter() {
        info!("Publishing container port {} on host port {}", container, host);
    }

    let runtime = Arc::new(RuntimeFactory::create_runtime(config.runtime));
    let pause_image = args.pause_image.unwrap_or(config.pause_image);
    let orchestrator = Orchestrator::new(
        runtime,
        RunIdentity::new(args.app, args.env, args.workload),
    )
    .with_pause_image(pause_image)
    .with_poll_interval(config.poll_interval)
    .with_progress(args.progress);

    // Once shutdown starts, a further Ctrl+C abandons cleanup.
    let mut phases = orchestrator.subscribe();
    let forced_exit = spawn_forced_exit(
        async move {
            let shutting_down = phases
                .wait_for(|phase| matches!(phase, Phase::Cancelling | Phase::CleaningUp))
                .await
                .is_ok();
            if !shutting_down {
                std::future::pending::<()>().await;
            }
        },
        shutdown_signal(),
        force_exit,
    );

    let result = orchestrator.run(plan, shutdown_signal()).await;
    forced_exit.abort();
    result?;
    info!("Local run finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localrun_core::progress::LogEmitter;

    fn args(app: &str) -> RunLocalArgs {
        RunLocalArgs {
            app: app.to_string(),
            env: "test".to_string(),
            workload: "api".to_string(),
            port_overrides: Vec::new(),
            env_overrides: Vec::new(),
            images: HashMap::new(),
            task_definition: None,
            pause_image: None,
            runtime: None,
            progress: Arc::new(LogEmitter),
        }
    }

    #[test]
    fn test_validate_rejects_blank_names() {
        assert!(args("shop").validate().is_ok());
        let err = args("  ").validate().unwrap_err();
        assert!(err.to_string().contains("application name"));
    }

    #[tokio::test]
    async fn test_missing_task_definition_file() {
        let mut run = args("shop");
        run.task_definition = Some(PathBuf::from("/nonexistent/task-definition.json"));
        let err = execute_run_local(run).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
