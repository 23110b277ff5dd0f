//! Configuration for the supervisor

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ResultKeyMap;
use crate::monitor::{default_thresholds, AlertThreshold};

/// Core configuration for the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Per-attempt timeout for an agent step
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Attempts per step before falling back
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Timeout for a single outbound send
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Timeout for creating a conversation thread; runs continue without one
    #[serde(default = "default_thread_timeout_ms")]
    pub thread_timeout_ms: u64,
    /// Idle time after which a connection is swept
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Interval of the lifecycle sweep
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Idle time after which an abandoned flow is dropped
    #[serde(default = "default_flow_idle_ttl_secs")]
    pub flow_idle_ttl_secs: u64,
    #[serde(default = "default_alert_retention_hours")]
    pub alert_retention_hours: u64,
    /// Capacity of the in-process event channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Extra agent result keys, merged over the built-in table
    #[serde(default)]
    pub result_keys: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_thresholds")]
    pub alert_thresholds: Vec<AlertThreshold>,
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    2
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_thread_timeout_ms() -> u64 {
    3_000
}

fn default_connection_timeout_secs() -> u64 {
    300
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_flow_idle_ttl_secs() -> u64 {
    3600
}

fn default_alert_retention_hours() -> u64 {
    24
}

fn default_event_channel_capacity() -> usize {
    1000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            max_attempts: default_max_attempts(),
            send_timeout_ms: default_send_timeout_ms(),
            thread_timeout_ms: default_thread_timeout_ms(),
            connection_timeout_secs: default_connection_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            flow_idle_ttl_secs: default_flow_idle_ttl_secs(),
            alert_retention_hours: default_alert_retention_hours(),
            event_channel_capacity: default_event_channel_capacity(),
            result_keys: BTreeMap::new(),
            alert_thresholds: default_thresholds(),
        }
    }
}

impl SupervisorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn thread_timeout(&self) -> Duration {
        Duration::from_millis(self.thread_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn flow_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.flow_idle_ttl_secs)
    }

    pub fn alert_retention(&self) -> Duration {
        Duration::from_secs(self.alert_retention_hours * 3600)
    }

    /// Built-in result key table with configured additions applied
    pub fn result_key_map(&self) -> ResultKeyMap {
        let mut keys = ResultKeyMap::default();
        for (agent, agent_keys) in &self.result_keys {
            keys.declare(agent.clone(), agent_keys.clone());
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SupervisorConfig = tokio_test::assert_ok!(serde_json::from_value(json!({
            "step_timeout_ms": 1500,
            "result_keys": {"pricing": ["pricing_result"]}
        })));

        assert_eq!(config.step_timeout(), Duration::from_millis(1500));
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.alert_retention(), Duration::from_secs(24 * 3600));
        assert_eq!(config.alert_thresholds.len(), 3);

        let keys = config.result_key_map();
        assert_eq!(keys.primary_key("pricing"), Some("pricing_result"));
        assert_eq!(keys.primary_key("triage"), Some("triage_result"));
    }
}
