//! Logging setup and span helpers.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::EchoError;

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = EchoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" | "" => Ok(LogFormat::Pretty),
            other => Err(EchoError::invalid_parameter(
                "log_format",
                format!("unsupported log format `{other}`"),
            )),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` controls levels (default
/// `info`). Later calls, and calls after another subscriber was installed,
/// do nothing.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
        // An embedding host may already own the global subscriber.
        let _ = installed;
    });
}

/// Span wrapping one analysis request.
#[must_use]
pub fn analysis_span(analysis_type: &str, generation: u64) -> Span {
    tracing::info_span!("analysis", analysis = analysis_type, catalog_generation = generation)
}
