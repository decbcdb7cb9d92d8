//! Runtime configuration for the scheduler core.
//!
//! Every knob named in the system overview lives here, loaded by
//! layering environment variables over the spec's own defaults. Missing
//! or malformed required values are a [`ConfigError`] at construction,
//! never a panic deeper in the scheduler.

use serde::Deserialize;

use crate::error::ConfigError;

fn default_polling_limit() -> usize {
    25
}
fn default_lock_timeout_minutes() -> i64 {
    10
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_seconds() -> i64 {
    60
}
fn default_poll_interval_seconds() -> u64 {
    30
}
fn default_lock_check_interval_seconds() -> u64 {
    30
}
fn default_stale_lease_seconds() -> i64 {
    60
}
fn default_retention_days() -> i64 {
    7
}
fn default_table_name() -> String {
    "CompanionMemory".to_string()
}

/// All configuration options the core recognizes. Field names match
/// the environment-variable names (upper-cased, `SCHED_` prefixed) once
/// loaded through [`SchedulerConfig::load`].
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_polling_limit")]
    pub polling_limit: usize,

    #[serde(default = "default_lock_timeout_minutes")]
    pub lock_timeout_minutes: i64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_seconds")]
    pub base_delay_seconds: i64,

    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    #[serde(default = "default_lock_check_interval_seconds")]
    pub lock_check_interval_seconds: u64,

    #[serde(default = "default_stale_lease_seconds")]
    pub stale_lease_seconds: i64,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default)]
    pub daily_summary_users: Vec<String>,

    #[serde(default)]
    pub work_sampling_prompts_per_day: u32,

    #[serde(default = "default_table_name")]
    pub table_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_limit: default_polling_limit(),
            lock_timeout_minutes: default_lock_timeout_minutes(),
            max_attempts: default_max_attempts(),
            base_delay_seconds: default_base_delay_seconds(),
            poll_interval_seconds: default_poll_interval_seconds(),
            lock_check_interval_seconds: default_lock_check_interval_seconds(),
            stale_lease_seconds: default_stale_lease_seconds(),
            retention_days: default_retention_days(),
            daily_summary_users: Vec::new(),
            work_sampling_prompts_per_day: 0,
            table_name: default_table_name(),
        }
    }
}

impl SchedulerConfig {
    /// Layer environment variables (prefixed `SCHED_`, `_`-separated)
    /// over the built-in defaults.
    ///
    /// `DAILY_SUMMARY_USERS` is read as a comma-separated list, matching
    /// the original implementation's environment variable of the same
    /// name.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut builder = config::Config::builder()
            .set_default("polling_limit", defaults.polling_limit as i64)
            .map_err(config_err)?
            .set_default("lock_timeout_minutes", defaults.lock_timeout_minutes)
            .map_err(config_err)?
            .set_default("max_attempts", defaults.max_attempts as i64)
            .map_err(config_err)?
            .set_default("base_delay_seconds", defaults.base_delay_seconds)
            .map_err(config_err)?
            .set_default("poll_interval_seconds", defaults.poll_interval_seconds as i64)
            .map_err(config_err)?
            .set_default(
                "lock_check_interval_seconds",
                defaults.lock_check_interval_seconds as i64,
            )
            .map_err(config_err)?
            .set_default("stale_lease_seconds", defaults.stale_lease_seconds)
            .map_err(config_err)?
            .set_default("retention_days", defaults.retention_days)
            .map_err(config_err)?
            .set_default("work_sampling_prompts_per_day", 0i64)
            .map_err(config_err)?
            .set_default("table_name", defaults.table_name.clone())
            .map_err(config_err)?
            .add_source(config::Environment::with_prefix("SCHED").separator("_"));

        if let Ok(users) = std::env::var("DAILY_SUMMARY_USERS") {
            let parsed: Vec<String> = users
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            builder = builder
                .set_override("daily_summary_users", parsed)
                .map_err(config_err)?;
        }

        let built = builder.build().map_err(config_err)?;
        built.try_deserialize().map_err(config_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError("max_attempts must be at least 1".into()));
        }
        if self.table_name.trim().is_empty() {
            return Err(ConfigError("table_name must not be empty".into()));
        }
        Ok(())
    }
}

fn config_err(e: impl std::fmt::Display) -> ConfigError {
    ConfigError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_spec() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.polling_limit, 25);
        assert_eq!(cfg.lock_timeout_minutes, 10);
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.base_delay_seconds, 60);
        assert_eq!(cfg.poll_interval_seconds, 30);
        assert_eq!(cfg.lock_check_interval_seconds, 30);
        assert_eq!(cfg.stale_lease_seconds, 60);
        assert_eq!(cfg.retention_days, 7);
        assert_eq!(cfg.table_name, "CompanionMemory");
    }

    #[test]
    fn validate_rejects_zero_max_attempts() {
        let mut cfg = SchedulerConfig::default();
        cfg.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }
}
