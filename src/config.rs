//! Harness configuration
//!
//! Settings shared by every [`TestCase`](crate::TestCase). Defaults can be
//! overridden from the environment:
//!
//! - `LOOP_TEST_TRACE_WATCHERS=true` appends a dump of pending watchers to
//!   timeout failures.
//! - `LOOP_TEST_TIMEOUT_MS=<n>` arms a timeout for every test that does not set
//!   its own.

use once_cell::sync::Lazy;
use std::time::Duration;

/// Environment variable enabling watcher traces in timeout failures
pub const TRACE_WATCHERS_ENV: &str = "LOOP_TEST_TRACE_WATCHERS";

/// Environment variable providing a default timeout in milliseconds
pub const DEFAULT_TIMEOUT_ENV: &str = "LOOP_TEST_TIMEOUT_MS";

static ENV_CONFIG: Lazy<HarnessConfig> = Lazy::new(|| {
    let config = HarnessConfig::default().merge_env(|key| std::env::var(key).ok());
    log::debug!("Loaded harness configuration from environment: {:?}", config);
    config
});

/// Configuration for running async test cases
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Include a dump of pending watchers when a test times out
    pub trace_watchers: bool,
    /// Timeout armed before the test body runs (None = no timeout)
    pub default_timeout: Option<Duration>,
    /// Fail on leftover unreferenced watchers as well as referenced ones
    pub check_unreferenced_watchers: bool,
}

impl HarnessConfig {
    /// Configuration read once from the process environment
    pub fn from_env() -> Self {
        ENV_CONFIG.clone()
    }

    /// Apply overrides looked up through `lookup`
    fn merge_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(TRACE_WATCHERS_ENV) {
            self.trace_watchers = parse_flag(&value);
        }

        if let Some(value) = lookup(DEFAULT_TIMEOUT_ENV) {
            match value.trim().parse::<u64>() {
                Ok(0) => self.default_timeout = None,
                Ok(ms) => self.default_timeout = Some(Duration::from_millis(ms)),
                Err(_) => log::warn!("Ignoring {}={:?}: not a number of milliseconds", DEFAULT_TIMEOUT_ENV, value),
            }
        }

        self
    }

    /// Enable or disable watcher traces
    pub fn with_trace_watchers(mut self, enabled: bool) -> Self {
        self.trace_watchers = enabled;
        self
    }

    /// Set the timeout armed for every test
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Fail on leftover unreferenced watchers too
    pub fn with_check_unreferenced_watchers(mut self, enabled: bool) -> Self {
        self.check_unreferenced_watchers = enabled;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
