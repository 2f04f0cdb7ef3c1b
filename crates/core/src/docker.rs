//! Container runtime client
//!
//! This module defines the run specification handed to the runtime, the
//! [`ContainerRuntime`] abstraction the orchestrator drives, a CLI-backed
//! implementation that works with both docker and podman, and an in-memory
//! mock used by tests.

use crate::errors::DockerError;
use async_trait::async_trait;
use console::{style, Color};
use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Host port published for a container port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedPort {
    pub host: u16,
    pub container: u16,
}

/// How a container's output lines are labelled on the terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub line_prefix: String,
    pub color: Color,
}

impl LogOptions {
    pub fn new(label: &str, color: Color) -> Self {
        Self {
            line_prefix: format!("[{}] ", label),
            color,
        }
    }
}

/// Hands out a distinct color to each container, cycling when exhausted
#[derive(Debug, Default)]
pub struct ColorCycle {
    next: usize,
}

impl ColorCycle {
    const PALETTE: [Color; 6] = [
        Color::Cyan,
        Color::Magenta,
        Color::Yellow,
        Color::Green,
        Color::Blue,
        Color::Red,
    ];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_color(&mut self) -> Color {
        let color = Self::PALETTE[self.next % Self::PALETTE.len()];
        self.next += 1;
        color
    }
}

/// Everything the runtime needs to start one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpecification {
    pub image: String,
    pub container_name: String,
    /// Name of the container whose network namespace to join
    pub network: Option<String>,
    pub ports: Vec<PublishedPort>,
    pub command: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    /// Passed through the runtime process environment, never on the command line
    pub secrets: BTreeMap<String, String>,
    pub log: LogOptions,
}

/// Runtime operations the orchestrator needs
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run a container in the foreground until it exits or `cancel` fires
    async fn run(&self, spec: &RunSpecification, cancel: &CancellationToken)
        -> Result<(), DockerError>;

    /// Whether the named container exists and is running
    async fn is_running(&self, name: &str) -> Result<bool, DockerError>;

    async fn stop(&self, name: &str) -> Result<(), DockerError>;

    async fn rm(&self, name: &str) -> Result<(), DockerError>;
}

/// Generic CLI-based container runtime implementation
///
/// This can be used for both Docker and Podman runtimes since they share
/// a compatible CLI interface.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    /// Container runtime CLI binary path (e.g., "docker" or "podman")
    runtime_path: String,
}

impl CliRuntime {
    /// Create a new CliRuntime for Docker
    pub fn docker() -> Self {
        Self {
            runtime_path: "docker".to_string(),
        }
    }

    /// Create a new CliRuntime for Podman
    pub fn podman() -> Self {
        Self {
            runtime_path: "podman".to_string(),
        }
    }

    /// Create a new CliRuntime with custom runtime binary path
    pub fn with_runtime_path(runtime_path: String) -> Self {
        Self { runtime_path }
    }

    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    /// Arguments for `run`; secret values stay out of the argument list
    pub fn run_args(spec: &RunSpecification) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            spec.container_name.clone(),
        ];
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(format!("container:{}", network));
        }
        for port in &spec.ports {
            args.push("--publish".to_string());
            args.push(format!("{}:{}", port.host, port.container));
        }
        for (key, value) in &spec.env_vars {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for key in spec.secrets.keys() {
            args.push("--env".to_string());
            args.push(key.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.runtime_path);
        // Keep runtime processes out of the terminal's foreground group so an
        // interrupt reaches only us; shutdown is driven through cancellation.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn output(&self, args: &[&str]) -> Result<Output, DockerError> {
        debug!("Executing runtime command: {} {}", self.runtime_path, args.join(" "));
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DockerError::NotInstalled,
                _ => DockerError::CLIError(format!("Failed to execute runtime command: {}", e)),
            })
    }

    /// Run a simple command against a named container, mapping "no such container"
    async fn container_command(&self, verb: &str, name: &str) -> Result<(), DockerError> {
        let output = self.output(&[verb, name]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Err(DockerError::ContainerNotFound {
                id: name.to_string(),
            });
        }
        Err(DockerError::CLIError(format!(
            "Runtime {} command failed: {}",
            verb,
            stderr.trim()
        )))
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::docker()
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Copy lines from a child stream to the terminal with the container's label.
///
/// Bytes that are not valid UTF-8 are printed lossily. The pipe is drained to
/// the end even after a read error so the runtime client never sees EPIPE.
async fn forward_lines<R>(reader: R, log: LogOptions, to_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let prefix = style(log.line_prefix).fg(log.color).bold();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if to_stderr {
                    eprintln!("{}{}", prefix, line);
                } else {
                    println!("{}{}", prefix, line);
                }
            }
            Err(e) => {
                warn!("Failed to read container output: {}", e);
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    debug!("Discarding remaining container output failed: {}", e);
                }
                break;
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    #[instrument(skip_all, fields(container = %spec.container_name))]
    async fn run(
        &self,
        spec: &RunSpecification,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError> {
        let args = Self::run_args(spec);
        debug!("Starting container with image {}", spec.image);

        let mut child = self
            .command()
            .args(&args)
            .envs(&spec.secrets)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DockerError::NotInstalled,
                _ => DockerError::CLIError(format!("Failed to spawn runtime run: {}", e)),
            })?;

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(stdout, spec.log.clone(), false)));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(stderr, spec.log.clone(), true)));
        }

        let outcome = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| {
                    DockerError::CLIError(format!("Failed to wait for runtime run: {}", e))
                })?;
                if status.success() {
                    Ok(())
                } else {
                    Err(DockerError::ExitStatus { code: status.code() })
                }
            }
            _ = cancel.cancelled() => {
                debug!("Run cancelled; terminating runtime client");
                if let Err(e) = child.kill().await {
                    warn!("Failed to terminate runtime client: {}", e);
                }
                Err(DockerError::Cancelled)
            }
        };

        for forwarder in forwarders {
            let _ = forwarder.await;
        }
        outcome
    }

    #[instrument(skip(self))]
    async fn is_running(&self, name: &str) -> Result<bool, DockerError> {
        let output = self
            .output(&[
                "inspect",
                "--type",
                "container",
                "--format",
                "{{.State.Running}}",
                name,
            ])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Ok(false);
            }
            return Err(DockerError::CLIError(format!(
                "Runtime inspect failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str) -> Result<(), DockerError> {
        self.container_command("stop", name).await
    }

    #[instrument(skip(self))]
    async fn rm(&self, name: &str) -> Result<(), DockerError> {
        self.container_command("rm", name).await
    }
}

/// In-memory runtime for tests
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    /// How a mocked `run` call behaves
    #[derive(Debug, Clone)]
    pub enum RunBehavior {
        /// Keep running until the token is cancelled
        UntilCancelled,
        /// Exit successfully after the delay
        Exit(Duration),
        /// Fail with the message after the delay
        Fail(Duration, String),
        /// Fail before the container is ever created
        FailToStart(String),
    }

    /// Record of a runtime call for verification in tests
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RuntimeCall {
        Run(String),
        IsRunning(String),
        Stop(String),
        Rm(String),
    }

    #[derive(Debug, Default)]
    struct State {
        existing: HashSet<String>,
        running: HashSet<String>,
        calls: Vec<RuntimeCall>,
        specs: Vec<RunSpecification>,
        polls: HashMap<String, usize>,
    }

    /// Mock runtime implementation
    #[derive(Debug)]
    pub struct MockRuntime {
        state: Mutex<State>,
        behaviors: HashMap<String, RunBehavior>,
        default_behavior: RunBehavior,
        polls_until_running: usize,
        stop_failures: HashSet<String>,
        rm_failures: HashSet<String>,
    }

    impl Default for MockRuntime {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(State::default()),
                behaviors: HashMap::new(),
                default_behavior: RunBehavior::UntilCancelled,
                polls_until_running: 0,
                stop_failures: HashSet::new(),
                rm_failures: HashSet::new(),
            }
        }

        /// Behavior of `run` for one container name
        pub fn with_behavior(mut self, container: &str, behavior: RunBehavior) -> Self {
            self.behaviors.insert(container.to_string(), behavior);
            self
        }

        pub fn with_default_behavior(mut self, behavior: RunBehavior) -> Self {
            self.default_behavior = behavior;
            self
        }

        /// Report "not running" for the first `polls` liveness checks of each container
        pub fn with_startup_polls(mut self, polls: usize) -> Self {
            self.polls_until_running = polls;
            self
        }

        pub fn with_stop_failure(mut self, container: &str) -> Self {
            self.stop_failures.insert(container.to_string());
            self
        }

        pub fn with_rm_failure(mut self, container: &str) -> Self {
            self.rm_failures.insert(container.to_string());
            self
        }

        /// Pretend a container already exists, as after a previous run
        pub fn add_existing(&self, container: &str) {
            if let Ok(mut state) = self.state.lock() {
                state.existing.insert(container.to_string());
            }
        }

        pub fn calls(&self) -> Vec<RuntimeCall> {
            self.state
                .lock()
                .map(|s| s.calls.clone())
                .unwrap_or_default()
        }

        pub fn run_specs(&self) -> Vec<RunSpecification> {
            self.state
                .lock()
                .map(|s| s.specs.clone())
                .unwrap_or_default()
        }

        pub fn spec_for(&self, container: &str) -> Option<RunSpecification> {
            self.run_specs()
                .into_iter()
                .find(|s| s.container_name == container)
        }

        pub fn exists(&self, container: &str) -> bool {
            self.state
                .lock()
                .map(|s| s.existing.contains(container))
                .unwrap_or(false)
        }

        /// Position of a call in the history
        pub fn position(&self, call: &RuntimeCall) -> Option<usize> {
            self.calls().iter().position(|c| c == call)
        }

        fn record(&self, call: RuntimeCall) -> Result<(), DockerError> {
            let mut state = self
                .state
                .lock()
                .map_err(|e| DockerError::CLIError(e.to_string()))?;
            state.calls.push(call);
            Ok(())
        }

        fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T, DockerError> {
            let mut state = self
                .state
                .lock()
                .map_err(|e| DockerError::CLIError(e.to_string()))?;
            Ok(f(&mut state))
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn run(
            &self,
            spec: &RunSpecification,
            cancel: &CancellationToken,
        ) -> Result<(), DockerError> {
            let name = spec.container_name.clone();
            self.record(RuntimeCall::Run(name.clone()))?;
            self.with_state(|s| s.specs.push(spec.clone()))?;

            let behavior = self
                .behaviors
                .iter()
                .find(|(key, _)| name == **key || name.starts_with(&format!("{}-", key)))
                .map(|(_, b)| b.clone())
                .unwrap_or_else(|| self.default_behavior.clone());

            if let RunBehavior::FailToStart(message) = &behavior {
                return Err(DockerError::CLIError(message.clone()));
            }

            self.with_state(|s| {
                s.existing.insert(name.clone());
                s.running.insert(name.clone());
            })?;

            let outcome = match behavior {
                RunBehavior::UntilCancelled => {
                    cancel.cancelled().await;
                    return Err(DockerError::Cancelled);
                }
                RunBehavior::Exit(delay) => tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(()),
                    _ = cancel.cancelled() => return Err(DockerError::Cancelled),
                },
                RunBehavior::Fail(delay, message) => tokio::select! {
                    _ = tokio::time::sleep(delay) => Err(DockerError::CLIError(message)),
                    _ = cancel.cancelled() => return Err(DockerError::Cancelled),
                },
                RunBehavior::FailToStart(_) => unreachable!("handled above"),
            };

            self.with_state(|s| {
                s.running.remove(&name);
            })?;
            outcome
        }

        async fn is_running(&self, name: &str) -> Result<bool, DockerError> {
            self.record(RuntimeCall::IsRunning(name.to_string()))?;
            let threshold = self.polls_until_running;
            self.with_state(|s| {
                let polls = s.polls.entry(name.to_string()).or_insert(0);
                *polls += 1;
                *polls > threshold && s.running.contains(name)
            })
        }

        async fn stop(&self, name: &str) -> Result<(), DockerError> {
            self.record(RuntimeCall::Stop(name.to_string()))?;
            if self.stop_failures.iter().any(|f| name.starts_with(f.as_str())) {
                return Err(DockerError::CLIError(format!("cannot stop {}", name)));
            }
            self.with_state(|s| {
                if s.existing.contains(name) {
                    s.running.remove(name);
                    Ok(())
                } else {
                    Err(DockerError::ContainerNotFound {
                        id: name.to_string(),
                    })
                }
            })?
        }

        async fn rm(&self, name: &str) -> Result<(), DockerError> {
            self.record(RuntimeCall::Rm(name.to_string()))?;
            if self.rm_failures.iter().any(|f| name.starts_with(f.as_str())) {
                return Err(DockerError::CLIError(format!("cannot remove {}", name)));
            }
            self.with_state(|s| {
                if s.existing.remove(name) {
                    s.running.remove(name);
                    Ok(())
                } else {
                    Err(DockerError::ContainerNotFound {
                        id: name.to_string(),
                    })
                }
            })?
        }
    }
}
