//! Structured logging setup.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `agent_chat=debug,info`.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Installs a compact stderr subscriber. Returns false when one was already set.
///
/// Malformed filter directives fall back to [`DEFAULT_LOG_FILTER`].
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let config = LogConfig {
            filter: "not a [valid filter".to_string(),
        };
        let _ = init_logging(&config);
        assert!(!init_logging(&LogConfig::default()));
    }
}
