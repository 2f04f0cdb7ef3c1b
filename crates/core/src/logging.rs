//! Logging and observability
//!
//! Structured logging via `tracing`, in human-readable text or JSON, selected at
//! runtime through CLI flags and environment variables.
//!
//! All logging output is directed to stderr so container output on stdout stays
//! readable.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log filter, takes precedence over `RUST_LOG`
pub const LOG_ENV: &str = "LOCALRUN_LOG";
/// Output format, `json` or `text`
pub const LOG_FORMAT_ENV: &str = "LOCALRUN_LOG_FORMAT";
/// Comma separated span lifecycle events (`new`, `close`, `full`, ...)
pub const LOG_SPAN_EVENTS_ENV: &str = "LOCALRUN_LOG_SPAN_EVENTS";

static INIT: Once = Once::new();

/// Initialize the logging system with an optional format
///
/// Safe to call more than once; only the first call installs a subscriber.
///
/// ## Arguments
///
/// * `format` - `None` or `"text"` for human-readable output, `"json"` for one
///   JSON object per event. `LOCALRUN_LOG_FORMAT` is consulted when `None`.
///
/// ## Environment Variables
///
/// * `LOCALRUN_LOG` - filter directive (e.g. `localrun_core=debug`)
/// * `RUST_LOG` - fallback filter directive
/// * `LOCALRUN_LOG_SPAN_EVENTS` - span lifecycle events to record
///
/// ## Example
///
/// ```rust
/// use localrun_core::logging;
///
/// logging::init(None).expect("Failed to initialize logging");
/// ```
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter();

        let env_format = std::env::var(LOG_FORMAT_ENV).ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");
        let span_events = span_events_for_format(effective_format);

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .with_target(false)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

fn create_env_filter() -> EnvFilter {
    if let Ok(spec) = std::env::var(LOG_ENV) {
        EnvFilter::try_new(&spec).unwrap_or_else(|_| {
            tracing::warn!(
                "Invalid {} specification '{}', using default 'info'",
                LOG_ENV,
                spec
            );
            EnvFilter::new("info")
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Span lifecycle events: env override, else quiet for text and NEW|CLOSE for JSON
fn span_events_for_format(format: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    if let Ok(raw) = std::env::var(LOG_SPAN_EVENTS_ENV) {
        let mut acc = FmtSpan::NONE;
        for token in raw.split(&[',', '|'][..]).map(|t| t.trim().to_lowercase()) {
            acc |= match token.as_str() {
                "new" => FmtSpan::NEW,
                "close" => FmtSpan::CLOSE,
                "enter" => FmtSpan::ENTER,
                "exit" => FmtSpan::EXIT,
                "active" => FmtSpan::ACTIVE,
                "full" => FmtSpan::FULL,
                _ => FmtSpan::NONE,
            };
        }
        return acc;
    }

    match format {
        "json" => FmtSpan::NEW | FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    }
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
