//! Logging for Synapse
//!
//! Installs a `tracing-subscriber` registry with an env filter and either a
//! human-readable or a JSON formatting layer

use synapse_config::{LogFormat, TelemetryConfig};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when neither the config nor `RUST_LOG` provide one
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Resolve the effective filter directive
///
/// An explicit override (usually from the command line) wins over the
/// config file, which wins over `RUST_LOG`.
pub fn resolve_filter(config: Option<&TelemetryConfig>, override_filter: Option<&str>) -> String {
    override_filter
        .map(str::to_owned)
        .or_else(|| config.and_then(|c| c.log_filter.clone()))
        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned())
}

/// Initialize logging from configuration
///
/// Logs go to stderr so stdout stays free for event output.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been installed
pub fn init(config: Option<&TelemetryConfig>, override_filter: Option<&str>) -> anyhow::Result<()> {
    let directive = resolve_filter(config, override_filter);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let format = config.map(|c| c.format).unwrap_or_default();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(fmt_layer).try_init(),
        LogFormat::Json => registry.with(fmt_layer.json().flatten_event(true)).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_beats_config() {
        let config = TelemetryConfig {
            log_filter: Some("warn".to_owned()),
            format: LogFormat::Pretty,
        };
        assert_eq!(resolve_filter(Some(&config), Some("trace")), "trace");
    }

    #[test]
    fn config_beats_environment() {
        temp_env::with_var("RUST_LOG", Some("error"), || {
            let config = TelemetryConfig {
                log_filter: Some("debug".to_owned()),
                format: LogFormat::Json,
            };
            assert_eq!(resolve_filter(Some(&config), None), "debug");
        });
    }

    #[test]
    fn falls_back_to_environment_then_default() {
        temp_env::with_var("RUST_LOG", Some("synapse_llm=trace"), || {
            assert_eq!(resolve_filter(None, None), "synapse_llm=trace");
        });
        temp_env::with_var_unset("RUST_LOG", || {
            assert_eq!(resolve_filter(None, None), DEFAULT_LOG_FILTER);
        });
    }
}
