use crate::commands::run_local::{execute_run_local, RunLocalArgs};
use crate::ui::spinner::CleanupSpinners;
use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use localrun_core::env::EnvOverride;
use localrun_core::images::parse_image_override;
use localrun_core::ports::PortOverride;
use localrun_core::progress::{LogEmitter, ProgressEmitter};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

/// Runtime selection options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum RuntimeOption {
    /// Docker runtime
    Docker,
    /// Podman runtime
    Podman,
}

impl From<RuntimeOption> for localrun_core::runtime::RuntimeKind {
    fn from(runtime: RuntimeOption) -> Self {
        match runtime {
            RuntimeOption::Docker => localrun_core::runtime::RuntimeKind::Docker,
            RuntimeOption::Podman => localrun_core::runtime::RuntimeKind::Podman,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

/// Options of the `run` subcommand
#[derive(Args, Debug)]
pub struct RunCommand {
    /// Name of the workload to run
    #[arg(short = 'n', long, value_name = "NAME")]
    pub workload: String,

    /// Name of the environment the workload is deployed to
    #[arg(short = 'e', long = "env", value_name = "NAME")]
    pub env: String,

    /// Name of the application
    #[arg(short = 'a', long, value_name = "NAME")]
    pub app: String,

    /// Publish a container port on a different host port (repeatable)
    #[arg(long = "port-override", value_name = "CONTAINER_PORT:HOST_PORT", value_parser = PortOverride::parse)]
    pub port_overrides: Vec<PortOverride>,

    /// Set an environment variable in every container, or in one with a CONTAINER: prefix (repeatable)
    #[arg(long = "env-var-override", value_name = "[CONTAINER:]KEY=VALUE", value_parser = EnvOverride::parse)]
    pub env_overrides: Vec<EnvOverride>,

    /// Run a locally built image instead of the task definition's image (repeatable)
    #[arg(long = "image", value_name = "NAME=URI", value_parser = parse_image_override)]
    pub images: Vec<(String, String)>,

    /// Read the task definition from a JSON file instead of the AWS CLI
    #[arg(long, value_name = "PATH")]
    pub task_definition: Option<PathBuf>,

    /// Image of the network anchor container (can be set via LOCALRUN_PAUSE_IMAGE env var)
    #[arg(long, value_name = "IMAGE")]
    pub pause_image: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a deployed workload's containers on this machine
    #[command(
        long_about = "Run a deployed workload's containers on this machine\n\n\
Fetches the workload's task definition, resolves its environment variables and secrets, \
starts a pause container that owns the shared network namespace, and runs every container \
against it. Containers are stopped and removed when they exit, when one fails, or on Ctrl+C."
    )]
    Run(RunCommand),
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Run deployed container workloads locally",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via LOCALRUN_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Container runtime to use (docker or podman, can be set via LOCALRUN_RUNTIME env var)
    #[arg(long, global = true, value_enum)]
    pub runtime: Option<RuntimeOption>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None, // Let logging module check environment variable
        };

        let log_level = match self.log_level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };

        if std::env::var_os(localrun_core::logging::LOG_ENV).is_none()
            && std::env::var_os("RUST_LOG").is_none()
        {
            std::env::set_var(
                "RUST_LOG",
                format!("localrun={},localrun_core={}", log_level, log_level),
            );
        }
        localrun_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", log_level);

        // Spinners only on an interactive stderr with human-readable logs
        let spinner_eligible =
            std::io::stderr().is_terminal() && !matches!(log_format, Some("json"));
        let progress: Arc<dyn ProgressEmitter> = if spinner_eligible {
            Arc::new(CleanupSpinners::new())
        } else {
            Arc::new(LogEmitter)
        };

        match self.command {
            Commands::Run(run) => {
                let args = RunLocalArgs {
                    app: run.app,
                    env: run.env,
                    workload: run.workload,
                    port_overrides: run.port_overrides,
                    env_overrides: run.env_overrides,
                    images: run.images.into_iter().collect(),
                    task_definition: run.task_definition,
                    pause_image: run.pause_image,
                    runtime: self.runtime.map(Into::into),
                    progress,
                };
                execute_run_local(args).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse_run(extra: &[&str]) -> RunCommand {
        let mut argv = vec!["localrun", "run", "-a", "shop", "-e", "test", "-n", "api"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Run(run) => run,
        }
    }

    #[test]
    fn test_run_requires_identity() {
        assert!(Cli::try_parse_from(["localrun", "run", "-a", "shop", "-e", "test"]).is_err());
        let run = parse_run(&[]);
        assert_eq!(run.app, "shop");
        assert_eq!(run.env, "test");
        assert_eq!(run.workload, "api");
        assert!(run.port_overrides.is_empty());
    }

    #[test]
    fn test_repeated_overrides() {
        let run = parse_run(&[
            "--port-override",
            "80:9090",
            "--port-override",
            "443:8443",
            "--env-var-override",
            "LOG_LEVEL=debug",
            "--env-var-override",
            "web:TOKEN=a=b",
            "--image",
            "web=local/web:dev",
        ]);
        assert_eq!(run.port_overrides.len(), 2);
        assert_eq!(run.port_overrides[0].container, 80);
        assert_eq!(run.port_overrides[0].host, 9090);
        assert_eq!(run.env_overrides[1].container.as_deref(), Some("web"));
        assert_eq!(run.env_overrides[1].value, "a=b");
        assert_eq!(
            run.images,
            vec![("web".to_string(), "local/web:dev".to_string())]
        );
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let base = ["localrun", "run", "-a", "shop", "-e", "test", "-n", "api"];
        for bad in [
            ["--port-override", "80"],
            ["--port-override", "http:80"],
            ["--env-var-override", "NOVALUE"],
            ["--image", "web"],
        ] {
            let argv: Vec<&str> = base.iter().chain(bad.iter()).copied().collect();
            assert!(Cli::try_parse_from(argv).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "localrun",
            "run",
            "-a",
            "shop",
            "-e",
            "test",
            "-n",
            "api",
            "--runtime",
            "podman",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.runtime, Some(RuntimeOption::Podman));
        assert!(matches!(cli.log_format, Some(LogFormat::Json)));
    }
}
