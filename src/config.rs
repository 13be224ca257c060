//! Environment configuration.

use std::env;
use std::time::Duration;

use agent_protocol::PlatformFulfillments;

use crate::logging::{LogConfig, DEFAULT_LOG_FILTER};

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub log_filter: Option<String>,
    pub platform_url: Option<String>,
    pub platform_token: Option<String>,
    pub oauth_redirect_uri: Option<String>,
    pub run_timeout_ms: Option<u64>,
    pub cache_fulfillments: bool,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            log_filter: env_string_opt("AGENT_CHAT_LOG"),
            platform_url: env_string_opt("AGENT_CHAT_PLATFORM_URL"),
            platform_token: env_string_opt("AGENT_CHAT_PLATFORM_TOKEN"),
            oauth_redirect_uri: env_string_opt("AGENT_CHAT_OAUTH_REDIRECT_URI"),
            run_timeout_ms: env_u64_opt("AGENT_CHAT_RUN_TIMEOUT_MS"),
            cache_fulfillments: env_flag_or("AGENT_CHAT_CACHE_FULFILLMENTS", true),
        }
    }

    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            run_timeout: self
                .run_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            cache_fulfillments: self.cache_fulfillments,
        }
    }

    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            filter: self
                .log_filter
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }

    #[must_use]
    pub fn platform_fulfillments(&self) -> PlatformFulfillments {
        let mut fulfillments =
            PlatformFulfillments::new(self.platform_token.clone().unwrap_or_default());
        if let Some(url) = &self.platform_url {
            fulfillments = fulfillments.with_platform_url(url.clone());
        }
        if let Some(redirect_uri) = &self.oauth_redirect_uri {
            fulfillments = fulfillments.with_redirect_uri(redirect_uri.clone());
        }
        fulfillments
    }
}

/// Knobs for [`crate::RunOrchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Fails a run whose completion has not resolved in time. Off when `None`.
    pub run_timeout: Option<Duration>,
    /// Reuses the first resolved fulfillment set until the conversation is cleared.
    pub cache_fulfillments: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            run_timeout: None,
            cache_fulfillments: true,
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = Some(run_timeout);
        self
    }

    #[must_use]
    pub fn with_cache_fulfillments(mut self, cache_fulfillments: bool) -> Self {
        self.cache_fulfillments = cache_fulfillments;
        self
    }
}

fn env_flag_or(key: &str, default: bool) -> bool {
    match env_string_opt(key).as_deref().map(str::trim) {
        Some("1") => true,
        Some("0") => false,
        _ => default,
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

fn env_u64_opt(key: &str) -> Option<u64> {
    env_string_opt(key).and_then(|value| value.trim().parse().ok())
}
