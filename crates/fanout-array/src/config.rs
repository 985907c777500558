//! Engine configuration.
//!
//! [`ArrayConfig`] can be deserialized from any serde format (durations use
//! humantime strings such as `"30s"`) or built from `FANOUT_*` environment
//! variables with [`ArrayConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sizing of one indexed work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueConfig {
    /// Concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Retries per item after the first failed attempt.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
    /// Maximum number of items kept in the index.
    #[serde(default = "default_index_cache_max_items")]
    pub index_cache_max_items: usize,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_queue_max_retries(),
            index_cache_max_items: default_index_cache_max_items(),
        }
    }
}

fn default_workers() -> usize {
    10
}

fn default_queue_max_retries() -> u32 {
    5
}

fn default_index_cache_max_items() -> usize {
    100_000
}

/// Admission-control settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceManagerConfig {
    /// Namespace tokens are allocated in. Empty disables admission control.
    #[serde(default)]
    pub primary_label: String,
}

impl ResourceManagerConfig {
    /// Returns true if subtasks must hold a token before launch.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.primary_label.is_empty()
    }
}

/// Configuration for the array engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayConfig {
    /// Largest executable array.
    #[serde(default = "default_max_array_job_size")]
    pub max_array_job_size: usize,

    /// Smallest per-subtask retry budget.
    ///
    /// Read by the host when it assigns retry budgets; the engine only validates it.
    #[serde(default = "default_min_retries")]
    pub min_retries: u32,

    /// Largest per-subtask retry budget; sizes the per-index retry counters.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Cap on combined error summaries, in bytes.
    #[serde(default = "default_max_error_string_length")]
    pub max_error_string_length: usize,

    /// How often the host should re-poll a running array.
    ///
    /// A scheduling hint for the host; the engine never sleeps on it.
    #[serde(default = "default_resync_period", with = "humantime_serde")]
    pub resync_period: Duration,

    /// How long a subtask may stay stuck before it is failed. Zero disables the check.
    #[serde(default, with = "humantime_serde")]
    pub max_system_level_timeout: Duration,

    /// Output assembly queue.
    #[serde(default)]
    pub output_assembler: WorkQueueConfig,

    /// Error assembly queue.
    #[serde(default)]
    pub error_assembler: WorkQueueConfig,

    /// Admission control.
    #[serde(default)]
    pub resource_manager: ResourceManagerConfig,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            max_array_job_size: default_max_array_job_size(),
            min_retries: default_min_retries(),
            max_retries: default_max_retries(),
            max_error_string_length: default_max_error_string_length(),
            resync_period: default_resync_period(),
            max_system_level_timeout: Duration::ZERO,
            output_assembler: WorkQueueConfig::default(),
            error_assembler: WorkQueueConfig::default(),
            resource_manager: ResourceManagerConfig::default(),
        }
    }
}

fn default_max_array_job_size() -> usize {
    5000
}

fn default_min_retries() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    10
}

fn default_max_error_string_length() -> usize {
    1000
}

fn default_resync_period() -> Duration {
    Duration::from_secs(30)
}

impl ArrayConfig {
    /// Loads configuration from `FANOUT_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `FANOUT_MAX_ARRAY_JOB_SIZE` | `max_array_job_size` |
    /// | `FANOUT_MIN_RETRIES` | `min_retries` |
    /// | `FANOUT_MAX_RETRIES` | `max_retries` |
    /// | `FANOUT_MAX_ERROR_LENGTH` | `max_error_string_length` |
    /// | `FANOUT_RESYNC_PERIOD` | `resync_period` |
    /// | `FANOUT_MAX_SYSTEM_LEVEL_TIMEOUT` | `max_system_level_timeout` |
    /// | `FANOUT_OUTPUT_ASSEMBLER_WORKERS` / `_MAX_RETRIES` / `_MAX_ITEMS` | `output_assembler` |
    /// | `FANOUT_ERROR_ASSEMBLER_WORKERS` / `_MAX_RETRIES` / `_MAX_ITEMS` | `error_assembler` |
    /// | `FANOUT_RESOURCE_MANAGER_PRIMARY_LABEL` | `resource_manager.primary_label` |
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or the
    /// resulting configuration fails [`ArrayConfig::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup` using the variable names of
    /// [`ArrayConfig::from_env`].
    ///
    /// # Errors
    ///
    /// Same as [`ArrayConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(v) = env.usize("FANOUT_MAX_ARRAY_JOB_SIZE")? {
            config.max_array_job_size = v;
        }
        if let Some(v) = env.u32("FANOUT_MIN_RETRIES")? {
            config.min_retries = v;
        }
        if let Some(v) = env.u32("FANOUT_MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = env.usize("FANOUT_MAX_ERROR_LENGTH")? {
            config.max_error_string_length = v;
        }
        if let Some(v) = env.duration("FANOUT_RESYNC_PERIOD")? {
            config.resync_period = v;
        }
        if let Some(v) = env.duration("FANOUT_MAX_SYSTEM_LEVEL_TIMEOUT")? {
            config.max_system_level_timeout = v;
        }
        env.queue("FANOUT_OUTPUT_ASSEMBLER", &mut config.output_assembler)?;
        env.queue("FANOUT_ERROR_ASSEMBLER", &mut config.error_assembler)?;
        if let Some(label) = env.string("FANOUT_RESOURCE_MANAGER_PRIMARY_LABEL") {
            config.resource_manager.primary_label = label;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.max_array_job_size == 0 {
            return Err(Error::configuration("max_array_job_size must be positive"));
        }
        if self.min_retries > self.max_retries {
            return Err(Error::configuration(format!(
                "min_retries ({}) must not exceed max_retries ({})",
                self.min_retries, self.max_retries
            )));
        }
        if self.max_error_string_length == 0 {
            return Err(Error::configuration(
                "max_error_string_length must be positive",
            ));
        }
        for (name, queue) in [
            ("output_assembler", &self.output_assembler),
            ("error_assembler", &self.error_assembler),
        ] {
            if queue.workers == 0 {
                return Err(Error::configuration(format!(
                    "{name}.workers must be positive"
                )));
            }
            if queue.index_cache_max_items == 0 {
                return Err(Error::configuration(format!(
                    "{name}.index_cache_max_items must be positive"
                )));
            }
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a usize: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u32: {e}")))
    }

    fn duration(&self, name: &str) -> Result<Option<Duration>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        humantime_serde::re::humantime::parse_duration(&v)
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a duration: {e}")))
    }

    fn queue(&self, prefix: &str, queue: &mut WorkQueueConfig) -> Result<()> {
        if let Some(v) = self.usize(&format!("{prefix}_WORKERS"))? {
            queue.workers = v;
        }
        if let Some(v) = self.u32(&format!("{prefix}_MAX_RETRIES"))? {
            queue.max_retries = v;
        }
        if let Some(v) = self.usize(&format!("{prefix}_MAX_ITEMS"))? {
            queue.index_cache_max_items = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = ArrayConfig::default();
        assert_eq!(config.max_array_job_size, 5000);
        assert_eq!(config.min_retries, 1);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.max_error_string_length, 1000);
        assert_eq!(config.resync_period, Duration::from_secs(30));
        assert!(config.max_system_level_timeout.is_zero());
        assert_eq!(config.output_assembler.workers, 10);
        assert_eq!(config.error_assembler.max_retries, 5);
        assert_eq!(config.output_assembler.index_cache_max_items, 100_000);
        assert!(!config.resource_manager.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_lookup_overrides() -> Result<()> {
        let config = ArrayConfig::from_lookup(lookup(&[
            ("FANOUT_MAX_ARRAY_JOB_SIZE", "100"),
            ("FANOUT_RESYNC_PERIOD", "2m"),
            ("FANOUT_MAX_SYSTEM_LEVEL_TIMEOUT", "15m"),
            ("FANOUT_OUTPUT_ASSEMBLER_WORKERS", "3"),
            ("FANOUT_ERROR_ASSEMBLER_MAX_ITEMS", "50"),
            ("FANOUT_RESOURCE_MANAGER_PRIMARY_LABEL", " gpu-pool "),
        ]))?;

        assert_eq!(config.max_array_job_size, 100);
        assert_eq!(config.resync_period, Duration::from_secs(120));
        assert_eq!(config.max_system_level_timeout, Duration::from_secs(900));
        assert_eq!(config.output_assembler.workers, 3);
        assert_eq!(config.error_assembler.index_cache_max_items, 50);
        assert_eq!(config.resource_manager.primary_label, "gpu-pool");
        Ok(())
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        let err = ArrayConfig::from_lookup(lookup(&[("FANOUT_MAX_RETRIES", "many")])).unwrap_err();
        assert!(err.to_string().contains("FANOUT_MAX_RETRIES"));

        let err = ArrayConfig::from_lookup(lookup(&[("FANOUT_RESYNC_PERIOD", "soon")])).unwrap_err();
        assert!(err.to_string().contains("FANOUT_RESYNC_PERIOD"));
    }

    #[test]
    fn validate_rejects_inconsistent_values() {
        let config = ArrayConfig {
            min_retries: 11,
            ..ArrayConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = ArrayConfig::default();
        config.error_assembler.workers = 0;
        assert!(config.validate().is_err());

        let config = ArrayConfig {
            max_array_job_size: 0,
            ..ArrayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_with_humantime_durations() {
        let config: ArrayConfig = serde_json::from_str(
            r#"{"max_array_job_size": 20, "resync_period": "45s", "output_assembler": {"workers": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.max_array_job_size, 20);
        assert_eq!(config.resync_period, Duration::from_secs(45));
        assert_eq!(config.output_assembler.workers, 2);
        assert_eq!(config.output_assembler.max_retries, 5);
        assert_eq!(config.max_retries, 10);
    }
}
