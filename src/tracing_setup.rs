use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::LogConfig;

fn env_filter(default_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level)
            .wrap_err_with(|| format!("Invalid log level: {default_level}")),
    }
}

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    init_tracing_with_config(&LogConfig {
        json: true,
        ..LogConfig::default()
    })
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    init_tracing_with_config(&LogConfig::default())
}

/// Initialize tracing from the `[log]` section; `RUST_LOG` overrides `level`
pub fn init_tracing_with_config(config: &LogConfig) -> Result<()> {
    let filter = env_filter(&config.level)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let registry = Registry::default().with(filter);
    let result = if config.json {
        registry
            .with(
                fmt_layer
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init()
    } else {
        registry.with(fmt_layer.pretty().with_ansi(true)).try_init()
    };
    result.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(
        level = %config.level,
        json = config.json,
        access_logs = config.access_logs,
        "Trellis logging initialized"
    );
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("GET", "/users/7", "req-123");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "request");
        }
    }
}
