use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use localrun_core::progress::{CleanupEvent, ProgressEmitter};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

fn default_style() -> ProgressStyle {
    // Use a green spinner and leave message coloring to message composition
    ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
}

fn finished_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// One spinner line per container being cleaned up, on stderr.
#[derive(Debug)]
pub struct CleanupSpinners {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl CleanupSpinners {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, container: &str) -> Option<ProgressBar> {
        let mut bars = self.bars.lock().ok()?;
        let bar = bars.entry(container.to_string()).or_insert_with(|| {
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(default_style());
            pb.enable_steady_tick(Duration::from_millis(80));
            pb
        });
        Some(bar.clone())
    }

    fn set_msg(&self, container: &str, msg: String) {
        if let Some(pb) = self.bar(container) {
            pb.set_message(msg);
        }
    }

    fn finish(&self, container: &str, msg: String) {
        let bar = self
            .bars
            .lock()
            .ok()
            .and_then(|mut bars| bars.remove(container));
        if let Some(pb) = bar {
            pb.set_style(finished_style());
            pb.finish_with_message(msg);
        }
    }
}

impl Default for CleanupSpinners {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CleanupSpinners {
    fn drop(&mut self) {
        if let Ok(bars) = self.bars.lock() {
            for pb in bars.values() {
                if !pb.is_finished() {
                    pb.finish_and_clear();
                }
            }
        }
    }
}

impl ProgressEmitter for CleanupSpinners {
    fn emit(&self, event: CleanupEvent) {
        match event {
            CleanupEvent::StopBegin { container } => {
                let msg = style(format!("Stopping {}…", container)).yellow().to_string();
                self.set_msg(&container, msg);
            }
            CleanupEvent::StopFailed { container, error } => {
                if let Some(pb) = self.bar(&container) {
                    pb.println(style(format!("stop {}: {}", container, error)).red().to_string());
                }
            }
            CleanupEvent::RemoveBegin { container } => {
                let msg = style(format!("Removing {}…", container)).yellow().to_string();
                self.set_msg(&container, msg);
            }
            CleanupEvent::RemoveFailed { container, error } => {
                if let Some(pb) = self.bar(&container) {
                    pb.println(style(format!("rm {}: {}", container, error)).red().to_string());
                }
            }
            CleanupEvent::Cleaned { container, success } => {
                let msg = if success {
                    style(format!("Cleaned up {}", container)).green().to_string()
                } else {
                    style(format!("Failed to clean up {}", container)).red().to_string()
                };
                self.finish(&container, msg);
            }
        }
    }
}
