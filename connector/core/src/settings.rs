// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Connector Settings
//!
//! YAML-backed configuration for the process engine (`connector-config.yaml`
//! by convention). Every field has a default so a connector can boot with an
//! empty file; durations are expressed in milliseconds.
//!
//! `lease.duration_ms` is the crash-recovery/latency trade-off: it must
//! comfortably exceed the dispatcher's worst-case round trip or a worker's
//! own lease can expire mid-send, producing a duplicate outbound message the
//! counterparty deduplicates by correlation id.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use uuid::Uuid;

use crate::application::process_manager::ProcessManagerConfig;
use crate::application::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorSettings {
    /// Lease holder name recorded by the stores; defaults to a fresh
    /// per-boot identifier.
    pub worker_id: String,
    pub process_manager: ProcessManagerSettings,
    pub lease: LeaseSettings,
    pub retry: RetrySettings,
    pub dispatch: DispatchSettings,
    pub commands: CommandSettings,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            worker_id: format!("connector-{}", &Uuid::new_v4().to_string()[..8]),
            process_manager: ProcessManagerSettings::default(),
            lease: LeaseSettings::default(),
            retry: RetrySettings::default(),
            dispatch: DispatchSettings::default(),
            commands: CommandSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessManagerSettings {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub min_poll_delay_ms: u64,
}

impl Default for ProcessManagerSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            poll_interval_ms: 1_000,
            min_poll_delay_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    pub duration_ms: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self { duration_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub cap_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 7,
            base_delay_ms: 1_000,
            cap_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub request_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub queue_capacity: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self { queue_capacity: 128 }
    }
}

impl ConnectorSettings {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse connector settings YAML")
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read settings file {}", path.as_ref().display())
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn process_manager_config(&self) -> ProcessManagerConfig {
        ProcessManagerConfig {
            worker: self.worker_id.clone(),
            batch_size: self.process_manager.batch_size,
            poll_interval: Duration::from_millis(self.process_manager.poll_interval_ms),
            min_poll_delay: Duration::from_millis(self.process_manager.min_poll_delay_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.cap_ms),
        )
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease.duration_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = ConnectorSettings::default();
        assert_eq!(settings.process_manager.batch_size, 20);
        assert_eq!(settings.retry.max_retries, 7);
        assert_eq!(settings.lease_duration(), Duration::from_secs(60));
        assert!(settings.worker_id.starts_with("connector-"));
    }

    #[test]
    fn test_partial_yaml_overrides_defaults() {
        let yaml = r#"
worker_id: connector-eu-1
process_manager:
  batch_size: 5
retry:
  max_retries: 2
  base_delay_ms: 250
"#;
        let settings = ConnectorSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.worker_id, "connector-eu-1");
        assert_eq!(settings.process_manager.batch_size, 5);
        // Unset section fields keep their defaults.
        assert_eq!(settings.process_manager.poll_interval_ms, 1_000);
        assert_eq!(settings.retry.max_retries, 2);
        assert_eq!(settings.retry.cap_ms, 60_000);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lease:\n  duration_ms: 5000").unwrap();

        let settings = ConnectorSettings::from_yaml_file(file.path()).unwrap();
        assert_eq!(settings.lease_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(ConnectorSettings::from_yaml_str("lease: [not, a, map]").is_err());
    }
}
