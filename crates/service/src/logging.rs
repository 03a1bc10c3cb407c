use reimburse_core::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `REIMBURSE_LOG` takes a full filter directive and wins
/// over `logging.level`. Returns false when a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_env("REIMBURSE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use reimburse_core::config::{LogFormat, LoggingConfig};

    use super::init_logging;

    #[test]
    fn second_initialisation_is_reported_not_fatal() {
        let config = LoggingConfig { level: "warn".to_string(), format: LogFormat::Json };
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
