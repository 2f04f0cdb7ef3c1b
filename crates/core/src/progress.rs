//! Cleanup progress events
//!
//! The orchestrator reports each stop/remove step through a [`ProgressEmitter`]
//! so front ends can render it (spinners, JSON lines) without the core knowing
//! about terminals.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One step of tearing a container down
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum CleanupEvent {
    #[serde(rename = "cleanup.stop.begin")]
    StopBegin { container: String },
    #[serde(rename = "cleanup.stop.failed")]
    StopFailed { container: String, error: String },
    #[serde(rename = "cleanup.rm.begin")]
    RemoveBegin { container: String },
    #[serde(rename = "cleanup.rm.failed")]
    RemoveFailed { container: String, error: String },
    /// Emitted once per container after both steps, with the overall outcome
    #[serde(rename = "cleanup.end")]
    Cleaned { container: String, success: bool },
}

impl CleanupEvent {
    pub fn container(&self) -> &str {
        match self {
            Self::StopBegin { container }
            | Self::StopFailed { container, .. }
            | Self::RemoveBegin { container }
            | Self::RemoveFailed { container, .. }
            | Self::Cleaned { container, .. } => container,
        }
    }
}

/// Sink for cleanup events; called concurrently from cleanup tasks
pub trait ProgressEmitter: Send + Sync {
    fn emit(&self, event: CleanupEvent);
}

/// Emitter that only traces events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmitter;

impl ProgressEmitter for LogEmitter {
    fn emit(&self, event: CleanupEvent) {
        debug!(?event, "cleanup progress");
    }
}

/// Emitter that keeps every event, for assertions
#[derive(Debug, Default, Clone)]
pub struct RecordingEmitter {
    events: Arc<Mutex<Vec<CleanupEvent>>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CleanupEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events for a single container, in emission order
    pub fn events_for(&self, container: &str) -> Vec<CleanupEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.container() == container)
            .collect()
    }
}

impl ProgressEmitter for RecordingEmitter {
    fn emit(&self, event: CleanupEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
