/// Configuration for the query registry.
///
/// Defaults work out of the box; override fields with the builder methods or
/// from the environment.
use crate::error::{LiveError, LiveResult};
use crate::types::DEFAULT_KEY_FIELD;
use std::time::Duration;

/// Default debounce window between a qualifying change and a refresh.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Environment variable overriding [`ObserverConfig::key_field`].
pub const ENV_KEY_FIELD: &str = "LIVE_DELTA_KEY_FIELD";
/// Environment variable overriding [`ObserverConfig::debounce`], in milliseconds.
pub const ENV_DEBOUNCE_MS: &str = "LIVE_DELTA_DEBOUNCE_MS";
/// Environment variable overriding [`ObserverConfig::initial_cached`].
pub const ENV_INITIAL_CACHED: &str = "LIVE_DELTA_INITIAL_CACHED";

/// Registry-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverConfig {
    /// Column that uniquely identifies a row within a result set (default: `_id`).
    pub key_field: String,
    /// Debounce window handed to the change notifier (default: 200ms).
    pub debounce: Duration,
    /// Whether a subscriber joining a live query adopts the cached rows
    /// instead of forcing a fetch (default: true).
    pub initial_cached: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            key_field: DEFAULT_KEY_FIELD.to_string(),
            debounce: DEFAULT_DEBOUNCE,
            initial_cached: true,
        }
    }
}

impl ObserverConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key field.
    pub fn key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = key_field.into();
        self
    }

    /// Set the debounce window.
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set whether joining subscribers reuse cached rows.
    pub fn initial_cached(mut self, initial_cached: bool) -> Self {
        self.initial_cached = initial_cached;
        self
    }

    /// Defaults overridden by `LIVE_DELTA_*` environment variables.
    pub fn from_env() -> LiveResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LiveResult<Self> {
        let mut config = Self::default();

        if let Some(key_field) = lookup(ENV_KEY_FIELD) {
            if key_field.trim().is_empty() {
                return Err(LiveError::invalid(format!("{} is empty", ENV_KEY_FIELD)));
            }
            config.key_field = key_field.trim().to_string();
        }

        if let Some(ms) = lookup(ENV_DEBOUNCE_MS) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                LiveError::invalid(format!("{} must be an integer, got '{}'", ENV_DEBOUNCE_MS, ms))
            })?;
            config.debounce = Duration::from_millis(ms);
        }

        if let Some(flag) = lookup(ENV_INITIAL_CACHED) {
            config.initial_cached = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(LiveError::invalid(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_INITIAL_CACHED, flag
                    )));
                }
            };
        }

        Ok(config)
    }

    /// Validate the settings.
    pub fn validate(&self) -> LiveResult<()> {
        if self.key_field.is_empty() {
            return Err(LiveError::invalid("key field must not be empty"));
        }
        Ok(())
    }
}

/// Per-registration overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Key field for this query; falls back to the registry's key field.
    pub key_field: Option<String>,
}

impl RegisterOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the key field.
    pub fn key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = Some(key_field.into());
        self
    }
}
