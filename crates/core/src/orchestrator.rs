//! Local run lifecycle
//!
//! A run starts a pause container that owns the network namespace, waits until
//! it is running, starts every application container on that namespace, and
//! finally stops and removes everything it started. The run phase shares one
//! cancellation token; cleanup never observes it.

use crate::cancel::CancellationWatcher;
use crate::config::{DEFAULT_PAUSE_IMAGE, DEFAULT_POLL_INTERVAL};
use crate::docker::{ColorCycle, ContainerRuntime, LogOptions, PublishedPort, RunSpecification};
use crate::env::ContainerEnvironment;
use crate::errors::{CleanupError, CleanupStep, DockerError, LocalRunError, Result};
use crate::ports::PortBindings;
use crate::progress::{CleanupEvent, LogEmitter, ProgressEmitter};
use console::Color;
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Role name of the network anchor container
pub const PAUSE_ROLE: &str = "pause";
/// Long-lived no-op command of the pause container
pub const PAUSE_COMMAND: [&str; 2] = ["sleep", "infinity"];

/// Application, environment and workload that scope container names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub app: String,
    pub env: String,
    pub workload: String,
}

impl RunIdentity {
    pub fn new(app: impl Into<String>, env: impl Into<String>, workload: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            env: env.into(),
            workload: workload.into(),
        }
    }

    /// `<role>-<app>-<env>-<workload>`
    pub fn container_name(&self, role: &str) -> String {
        format!("{}-{}-{}-{}", role, self.app, self.env, self.workload)
    }

    pub fn pause_name(&self) -> String {
        self.container_name(PAUSE_ROLE)
    }
}

/// Lifecycle phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PauseStarting,
    PauseConfirmedRunning,
    AppsStarting,
    Running,
    Completed,
    Cancelling,
    CleaningUp,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PauseStarting => "pause-starting",
            Self::PauseConfirmedRunning => "pause-confirmed-running",
            Self::AppsStarting => "apps-starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelling => "cancelling",
            Self::CleaningUp => "cleaning-up",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Everything resolved before any container starts
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub ports: PortBindings,
    /// Logical container name and image, in start order
    pub containers: Vec<(String, String)>,
    pub environment: ContainerEnvironment,
}

impl RunPlan {
    pub fn new(
        ports: PortBindings,
        containers: Vec<(String, String)>,
        environment: ContainerEnvironment,
    ) -> Self {
        Self {
            ports,
            containers,
            environment,
        }
    }
}

type PauseHandle = JoinHandle<std::result::Result<(), DockerError>>;

/// Drives one local run from pause container start to cleanup
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    identity: RunIdentity,
    pause_image: String,
    poll_interval: Duration,
    progress: Arc<dyn ProgressEmitter>,
    phase: watch::Sender<Phase>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, identity: RunIdentity) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            runtime,
            identity,
            pause_image: DEFAULT_PAUSE_IMAGE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            progress: Arc::new(LogEmitter),
            phase,
        }
    }

    pub fn with_pause_image(mut self, image: impl Into<String>) -> Self {
        self.pause_image = image.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressEmitter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// Receiver that observes every phase transition
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: Phase) {
        debug!("Run phase: {}", phase);
        self.phase.send_replace(phase);
    }

    /// Run the plan until every application container exits, one fails, or
    /// `interrupt` resolves; then clean up.
    ///
    /// Errors observed after an operator interrupt are treated as shutdown
    /// artifacts and dropped. Cleanup errors are always reported.
    #[instrument(skip_all, fields(app = %self.identity.app, env = %self.identity.env, workload = %self.identity.workload))]
    pub async fn run<F>(&self, plan: RunPlan, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let watcher = CancellationWatcher::spawn(interrupt, token.clone());
        let interrupted = watcher.flag();

        let mut attempted = Vec::new();
        let run_error = self
            .run_phase(&plan, &token, &interrupted, &mut attempted)
            .await;
        token.cancel();
        watcher.finish().await;

        self.set_phase(Phase::CleaningUp);
        let cleanup_errors = self.cleanup(&attempted).await;
        self.set_phase(Phase::Done);

        match LocalRunError::aggregate(run_error, cleanup_errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn run_phase(
        &self,
        plan: &RunPlan,
        token: &CancellationToken,
        interrupted: &AtomicBool,
        attempted: &mut Vec<String>,
    ) -> Option<LocalRunError> {
        let pause_name = self.identity.pause_name();
        self.set_phase(Phase::PauseStarting);
        info!("Starting pause container {}", pause_name);

        let runtime = Arc::clone(&self.runtime);
        let pause_spec = self.pause_spec(plan);
        let pause_token = token.clone();
        let mut pause: PauseHandle =
            tokio::spawn(async move { runtime.run(&pause_spec, &pause_token).await });

        let mut pause_running = true;
        let confirmed = tokio::select! {
            result = &mut pause => {
                pause_running = false;
                Err(pause_exited(result))
            }
            polled = self.wait_until_running(&pause_name, token) => polled,
        };
        if let Err(error) = confirmed {
            token.cancel();
            if pause_running {
                drain_pause(pause).await;
            }
            return suppress_if_interrupted(error, interrupted);
        }
        self.set_phase(Phase::PauseConfirmedRunning);
        debug!("Pause container {} is running", pause_name);

        self.set_phase(Phase::AppsStarting);
        let mut apps = JoinSet::new();
        let mut colors = ColorCycle::new();
        for (logical, image) in &plan.containers {
            let spec = self.app_spec(logical, image, &plan.environment, colors.next_color());
            info!("Starting container {}", spec.container_name);
            attempted.push(spec.container_name.clone());

            let runtime = Arc::clone(&self.runtime);
            let app_token = token.clone();
            let logical = logical.clone();
            apps.spawn(async move {
                let result = runtime.run(&spec, &app_token).await;
                (logical, result)
            });
        }
        self.set_phase(Phase::Running);

        let mut first_error: Option<LocalRunError> = None;
        let mut cancelling = false;
        loop {
            let observed = tokio::select! {
                joined = apps.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(())))) => {
                        info!("Container {} exited", name);
                        None
                    }
                    Some(Ok((name, Err(source)))) => Some(LocalRunError::Container { name, source }),
                    Some(Err(e)) => Some(join_failure("container", e)),
                },
                result = &mut pause, if pause_running => {
                    pause_running = false;
                    Some(pause_exited(result))
                }
                _ = token.cancelled(), if !cancelling => {
                    cancelling = true;
                    self.set_phase(Phase::Cancelling);
                    None
                }
            };

            if let Some(error) = observed {
                if first_error.is_none() {
                    first_error = suppress_if_interrupted(error, interrupted);
                } else {
                    debug!("Ignoring error after first failure: {}", error);
                }
                token.cancel();
            }
        }

        if !cancelling {
            self.set_phase(Phase::Completed);
        }
        token.cancel();
        if pause_running {
            drain_pause(pause).await;
        }
        first_error
    }

    /// Poll until the pause container reports running
    async fn wait_until_running(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> std::result::Result<(), LocalRunError> {
        loop {
            match self.runtime.is_running(name).await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(DockerError::ContainerNotFound { .. }) => {}
                Err(source) => return Err(LocalRunError::PauseContainer { source }),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = token.cancelled() => return Err(LocalRunError::Cancelled),
            }
        }
    }

    fn pause_spec(&self, plan: &RunPlan) -> RunSpecification {
        RunSpecification {
            image: self.pause_image.clone(),
            container_name: self.identity.pause_name(),
            network: None,
            ports: plan
                .ports
                .iter()
                .map(|(container, host)| PublishedPort { host, container })
                .collect(),
            command: PAUSE_COMMAND.iter().map(|s| s.to_string()).collect(),
            env_vars: Default::default(),
            secrets: Default::default(),
            log: LogOptions::new(PAUSE_ROLE, Color::White),
        }
    }

    fn app_spec(
        &self,
        logical: &str,
        image: &str,
        environment: &ContainerEnvironment,
        color: Color,
    ) -> RunSpecification {
        let (env_vars, secrets) = environment.split(logical);
        RunSpecification {
            image: image.to_string(),
            container_name: self.identity.container_name(logical),
            network: Some(self.identity.pause_name()),
            ports: Vec::new(),
            command: Vec::new(),
            env_vars,
            secrets,
            log: LogOptions::new(logical, color),
        }
    }

    /// Stop and remove application containers concurrently, then the pause container
    async fn cleanup(&self, apps: &[String]) -> Vec<CleanupError> {
        info!("Cleaning up {} containers", apps.len() + 1);
        let mut errors: Vec<CleanupError> = join_all(apps.iter().map(|name| self.clean_container(name)))
            .await
            .into_iter()
            .flatten()
            .collect();
        errors.extend(self.clean_container(&self.identity.pause_name()).await);
        errors
    }

    /// Stop then remove one container; removal is attempted even if stop failed
    async fn clean_container(&self, name: &str) -> Vec<CleanupError> {
        let mut errors = Vec::new();

        self.progress.emit(CleanupEvent::StopBegin {
            container: name.to_string(),
        });
        if let Err(source) = self.runtime.stop(name).await {
            warn!("Failed to stop {}: {}", name, source);
            self.progress.emit(CleanupEvent::StopFailed {
                container: name.to_string(),
                error: source.to_string(),
            });
            errors.push(CleanupError {
                container: name.to_string(),
                step: CleanupStep::Stop,
                source,
            });
        }

        self.progress.emit(CleanupEvent::RemoveBegin {
            container: name.to_string(),
        });
        if let Err(source) = self.runtime.rm(name).await {
            warn!("Failed to remove {}: {}", name, source);
            self.progress.emit(CleanupEvent::RemoveFailed {
                container: name.to_string(),
                error: source.to_string(),
            });
            errors.push(CleanupError {
                container: name.to_string(),
                step: CleanupStep::Remove,
                source,
            });
        }

        self.progress.emit(CleanupEvent::Cleaned {
            container: name.to_string(),
            success: errors.is_empty(),
        });
        errors
    }
}

/// Drop errors that are only a consequence of shutdown
fn suppress_if_interrupted(error: LocalRunError, interrupted: &AtomicBool) -> Option<LocalRunError> {
    if error.is_cancellation() {
        debug!("Ignoring cancelled run: {}", error);
        None
    } else if interrupted.load(Ordering::SeqCst) {
        debug!("Suppressing error after operator interrupt: {}", error);
        None
    } else {
        Some(error)
    }
}

/// The pause container's run call returned, which it only does on failure
fn pause_exited(
    result: std::result::Result<std::result::Result<(), DockerError>, JoinError>,
) -> LocalRunError {
    match result {
        Ok(Ok(())) => LocalRunError::PauseContainer {
            source: DockerError::ExitStatus { code: Some(0) },
        },
        Ok(Err(source)) => LocalRunError::PauseContainer { source },
        Err(e) => join_failure("pause container", e),
    }
}

fn join_failure(what: &str, error: JoinError) -> LocalRunError {
    LocalRunError::Internal(format!("{} task failed: {}", what, error))
}

/// Wait for a cancelled pause run to return
async fn drain_pause(pause: PauseHandle) {
    match pause.await {
        Ok(Ok(())) | Ok(Err(DockerError::Cancelled)) => {}
        Ok(Err(e)) => debug!("Pause container run ended: {}", e),
        Err(e) => debug!("Pause container task ended: {}", e),
    }
}
