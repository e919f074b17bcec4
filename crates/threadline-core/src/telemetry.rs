//! Tracing subscriber setup for hosts embedding the engine.
//!
//! The library only emits events; a host calls [`init_tracing`] once at
//! startup with the `[log]` section of its [`ClientConfig`](crate::ClientConfig).
//! Two environment variables win over the config:
//!
//! - `THREADLINE_LOG`: `EnvFilter` directives
//! - `THREADLINE_LOG_FORMAT`: `compact` or `json`

use std::env;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{LogConfig, LogFormat};

pub const FILTER_ENV: &str = "THREADLINE_LOG";
pub const FORMAT_ENV: &str = "THREADLINE_LOG_FORMAT";
pub const DEFAULT_FILTER: &str = "threadline_core=info,warn";

fn filter_directives(config: &LogConfig, from_env: Option<String>) -> String {
    from_env
        .or_else(|| config.filter.clone())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn log_format(config: &LogConfig, from_env: Option<&str>) -> LogFormat {
    match from_env {
        Some("json") => LogFormat::Json,
        Some("compact") => LogFormat::Compact,
        _ => config.format,
    }
}

/// Install the global tracing subscriber.
///
/// Returns `false` when a subscriber was already installed; it is left in
/// place. Unparseable directives fall back to [`DEFAULT_FILTER`].
pub fn init_tracing(config: &LogConfig) -> bool {
    let directives = filter_directives(config, env::var(FILTER_ENV).ok());
    let (filter, rejected) = match EnvFilter::try_new(&directives) {
        Ok(filter) => (filter, None),
        Err(error) => (EnvFilter::new(DEFAULT_FILTER), Some(error)),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let format = log_format(config, env::var(FORMAT_ENV).ok().as_deref());
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_ansi(false))
            .try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    }
    .is_ok();

    if let Some(error) = rejected {
        tracing::warn!(%directives, %error, "invalid log filter, using default");
    }
    if installed {
        tracing::debug!(?format, %directives, "tracing installed");
    }
    installed
}
