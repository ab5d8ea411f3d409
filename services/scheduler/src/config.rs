//! Configuration for the scheduler.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::factory::FactoryConfig;
use crate::matcher::GpuSchedulingBehavior;
use crate::model::UNRESERVED_ROLE;
use crate::monitor::MonitorConfig;
use crate::processor::ProcessorConfig;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Written into reservation labels.
    pub framework_id: String,

    /// Role new reservations are made for.
    pub reservation_role: String,

    /// Role accepted when a run spec declares none.
    pub accepted_role: String,

    pub processor_shards: usize,
    pub processor_mailbox: usize,
    pub store_timeout: Duration,
    pub op_deadline: Duration,

    pub launch_unconfirmed_timeout: Duration,
    pub launch_timeout: Duration,
    pub reservation_timeout: Duration,

    pub monitor_initial_delay: Duration,
    pub monitor_interval: Duration,
    pub terminal_expunge_delay: Duration,

    pub gpu_scheduling: GpuSchedulingBehavior,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a non-negative integer, got '{raw}'")),
                None => Ok(default),
            }
        };
        // Intervals, timeouts and pool sizes of zero would stall or panic.
        let positive = |key: &str, default: u64| -> Result<u64> {
            match number(key, default)? {
                0 => Err(anyhow!("{key} must be greater than zero")),
                value => Ok(value),
            }
        };
        let secs = |key: &str, default: u64| number(key, default).map(Duration::from_secs);
        let positive_secs = |key: &str, default: u64| positive(key, default).map(Duration::from_secs);
        let positive_millis =
            |key: &str, default: u64| positive(key, default).map(Duration::from_millis);

        let gpu_scheduling = match lookup("KEEL_GPU_SCHEDULING") {
            Some(raw) => raw
                .parse::<GpuSchedulingBehavior>()
                .map_err(|e| anyhow!("KEEL_GPU_SCHEDULING: {e}"))?,
            None => GpuSchedulingBehavior::default(),
        };

        Ok(Self {
            log_level: string("KEEL_LOG_LEVEL", "info"),
            framework_id: string("KEEL_FRAMEWORK_ID", "keel"),
            reservation_role: string("KEEL_RESERVATION_ROLE", "keel"),
            accepted_role: string("KEEL_ACCEPTED_ROLE", UNRESERVED_ROLE),
            processor_shards: usize::try_from(positive("KEEL_PROCESSOR_SHARDS", 8)?)?,
            processor_mailbox: usize::try_from(positive("KEEL_PROCESSOR_MAILBOX", 256)?)?,
            store_timeout: positive_millis("KEEL_STORE_TIMEOUT_MS", 5000)?,
            op_deadline: positive_millis("KEEL_OP_DEADLINE_MS", 10_000)?,
            launch_unconfirmed_timeout: secs("KEEL_TASK_LAUNCH_UNCONFIRMED_TIMEOUT_SECS", 300)?,
            launch_timeout: secs("KEEL_TASK_LAUNCH_TIMEOUT_SECS", 300)?,
            reservation_timeout: secs("KEEL_RESERVATION_TIMEOUT_SECS", 300)?,
            monitor_initial_delay: secs("KEEL_MONITOR_INITIAL_DELAY_SECS", 30)?,
            monitor_interval: positive_secs("KEEL_MONITOR_INTERVAL_SECS", 5)?,
            terminal_expunge_delay: secs("KEEL_TERMINAL_EXPUNGE_DELAY_SECS", 0)?,
            gpu_scheduling,
        })
    }

    pub fn processor(&self) -> ProcessorConfig {
        ProcessorConfig {
            shards: self.processor_shards,
            mailbox_size: self.processor_mailbox,
            store_timeout: self.store_timeout,
            op_deadline: self.op_deadline,
        }
    }

    pub fn factory(&self) -> Result<FactoryConfig> {
        Ok(FactoryConfig {
            framework_id: self.framework_id.clone(),
            reservation_role: self.reservation_role.clone(),
            default_role: self.accepted_role.clone(),
            reservation_timeout: chrono::Duration::from_std(self.reservation_timeout)
                .context("reservation timeout out of range")?,
        })
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            unconfirmed_timeout: self.launch_unconfirmed_timeout,
            launch_timeout: self.launch_timeout,
            terminal_expunge_delay: self.terminal_expunge_delay,
            initial_delay: self.monitor_initial_delay,
            interval: self.monitor_interval,
            ..MonitorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.framework_id, "keel");
        assert_eq!(config.accepted_role, "*");
        assert_eq!(config.processor_shards, 8);
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.monitor_initial_delay, Duration::from_secs(30));
        assert_eq!(config.terminal_expunge_delay, Duration::ZERO);
        assert_eq!(config.gpu_scheduling, GpuSchedulingBehavior::Restricted);

        let factory = config.factory().unwrap();
        assert_eq!(factory.reservation_timeout, chrono::Duration::minutes(5));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("KEEL_PROCESSOR_SHARDS", "2"),
            ("KEEL_STORE_TIMEOUT_MS", "250"),
            ("KEEL_GPU_SCHEDULING", "Unrestricted"),
            ("KEEL_RESERVATION_ROLE", "db"),
        ])
        .unwrap();
        assert_eq!(config.processor().shards, 2);
        assert_eq!(config.processor().store_timeout, Duration::from_millis(250));
        assert_eq!(config.gpu_scheduling, GpuSchedulingBehavior::Unrestricted);
        assert_eq!(config.factory().unwrap().reservation_role, "db");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(config(&[("KEEL_MONITOR_INTERVAL_SECS", "soon")]).is_err());
        assert!(config(&[("KEEL_GPU_SCHEDULING", "sometimes")]).is_err());
    }

    #[test]
    fn test_rejects_zero_intervals_and_timeouts() {
        for key in [
            "KEEL_MONITOR_INTERVAL_SECS",
            "KEEL_STORE_TIMEOUT_MS",
            "KEEL_OP_DEADLINE_MS",
            "KEEL_PROCESSOR_SHARDS",
            "KEEL_PROCESSOR_MAILBOX",
        ] {
            let err = config(&[(key, "0")]).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }
        // A zero grace delay is a valid choice.
        let config = config(&[("KEEL_TERMINAL_EXPUNGE_DELAY_SECS", "0")]).unwrap();
        assert_eq!(config.terminal_expunge_delay, Duration::ZERO);
    }
}
