//! Core library for the localrun CLI
//!
//! This crate contains the logic for running a deployed multi-container task
//! definition on a local container runtime: environment and secret resolution,
//! port bindings, the pause-container lifecycle, cleanup, logging, and error
//! handling.

pub mod aws;
pub mod cancel;
pub mod config;
pub mod credentials;
pub mod docker;
pub mod env;
pub mod errors;
pub mod images;
pub mod logging;
pub mod orchestrator;
pub mod ports;
pub mod progress;
pub mod runtime;
pub mod secrets;
pub mod task;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
