use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    interval::{DEFAULT_INTERVAL_MS, MAX_INTERVAL_MS},
    types::{Qos, SleepMode},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u16,
    pub connect_timeout_ms: u64,
    pub qos: Qos,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "test.mosquitto.org".to_string(),
            port: 1883,
            client_id: "senseclima-00001".to_string(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: 240,
            connect_timeout_ms: 10_000,
            qos: Qos::AtMostOnce,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DutyCycleConfig {
    pub sample_period_ms: u32,
    pub ready_samples: u32,
    pub failure_threshold: u32,
    pub connect_backoff_ms: u32,
    pub publish_pacing_ms: u32,
    pub publish_retry_delay_ms: u32,
    pub poll_timeout_ms: u32,
    pub poll_error_backoff_ms: u32,
    pub poller_grace_ms: u32,
    pub idle_log_period_ms: u32,
    pub inbound_queue_depth: usize,
    pub poller_stack_size: usize,
    pub duty_cycle_stack_size: usize,
    pub default_interval_ms: u32,
    pub sleep_mode: SleepMode,
}

// The host link drives a tokio runtime from these threads.
#[cfg(target_os = "espidf")]
const POLLER_STACK_SIZE: usize = 8 * 1024;
#[cfg(not(target_os = "espidf"))]
const POLLER_STACK_SIZE: usize = 256 * 1024;

#[cfg(target_os = "espidf")]
const DUTY_CYCLE_STACK_SIZE: usize = 16 * 1024;
#[cfg(not(target_os = "espidf"))]
const DUTY_CYCLE_STACK_SIZE: usize = 256 * 1024;

const MIN_STACK_SIZE: usize = 4 * 1024;

impl Default for DutyCycleConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: 1_000,
            ready_samples: 10,
            failure_threshold: 60,
            connect_backoff_ms: 5_000,
            publish_pacing_ms: 2_000,
            publish_retry_delay_ms: 1_000,
            poll_timeout_ms: 10,
            poll_error_backoff_ms: 2_000,
            poller_grace_ms: 1_000,
            idle_log_period_ms: 2_000,
            inbound_queue_depth: 4,
            poller_stack_size: POLLER_STACK_SIZE,
            duty_cycle_stack_size: DUTY_CYCLE_STACK_SIZE,
            default_interval_ms: DEFAULT_INTERVAL_MS,
            sleep_mode: SleepMode::Hibernate,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub broker: BrokerConfig,
    pub duty_cycle: DutyCycleConfig,
}

impl NodeConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(json)?;
        config.sanitize();
        Ok(config)
    }

    pub fn from_build_env() -> Self {
        let mut config = match option_env!("SENSECLIMA_CONFIG") {
            Some(json) => Self::from_json(json).unwrap_or_else(|err| {
                warn!("ignoring invalid SENSECLIMA_CONFIG: {err}");
                Self::default()
            }),
            None => Self::default(),
        };

        if let Some(host) = option_env!("MQTT_HOST") {
            config.broker.host = host.to_string();
        }
        if let Some(port) = option_env!("MQTT_PORT").and_then(|value| value.parse().ok()) {
            config.broker.port = port;
        }
        if let Some(user) = option_env!("MQTT_USER") {
            config.broker.username = user.to_string();
        }
        if let Some(pass) = option_env!("MQTT_PASS") {
            config.broker.password = pass.to_string();
        }
        if let Some(client_id) = option_env!("MQTT_CLIENT_ID") {
            config.broker.client_id = client_id.to_string();
        }

        config.sanitize();
        config
    }

    pub fn sanitize(&mut self) {
        self.broker.sanitize();
        self.duty_cycle.sanitize();
    }
}

impl BrokerConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.host.trim().is_empty() {
            self.host = defaults.host;
        }
        if self.port == 0 {
            self.port = defaults.port;
        }
        if self.client_id.trim().is_empty() {
            self.client_id = defaults.client_id;
        }
        self.keep_alive_secs = self.keep_alive_secs.clamp(5, 3_600);
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(1_000, 120_000);
    }
}

impl DutyCycleConfig {
    pub fn sanitize(&mut self) {
        self.sample_period_ms = self.sample_period_ms.clamp(100, 60_000);
        self.ready_samples = self.ready_samples.max(1);
        self.failure_threshold = self.failure_threshold.max(1);
        self.connect_backoff_ms = self.connect_backoff_ms.clamp(100, 300_000);
        self.publish_pacing_ms = self.publish_pacing_ms.min(60_000);
        self.publish_retry_delay_ms = self.publish_retry_delay_ms.min(60_000);
        self.poll_timeout_ms = self.poll_timeout_ms.clamp(1, 1_000);
        self.poll_error_backoff_ms = self.poll_error_backoff_ms.clamp(10, 60_000);
        self.poller_grace_ms = self.poller_grace_ms.clamp(10, 10_000);
        self.idle_log_period_ms = self.idle_log_period_ms.clamp(100, 60_000);
        self.inbound_queue_depth = self.inbound_queue_depth.clamp(1, 64);
        self.poller_stack_size = self.poller_stack_size.max(MIN_STACK_SIZE);
        self.duty_cycle_stack_size = self.duty_cycle_stack_size.max(MIN_STACK_SIZE);

        if self.default_interval_ms == 0 || self.default_interval_ms > MAX_INTERVAL_MS {
            self.default_interval_ms = DEFAULT_INTERVAL_MS;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_reference_timings() {
        let config = NodeConfig::default();

        assert_eq!(config.duty_cycle.sample_period_ms, 1_000);
        assert_eq!(config.duty_cycle.ready_samples, 10);
        assert_eq!(config.duty_cycle.failure_threshold, 60);
        assert_eq!(config.duty_cycle.connect_backoff_ms, 5_000);
        assert_eq!(config.duty_cycle.default_interval_ms, 30_000);
        assert_eq!(config.broker.qos, Qos::AtMostOnce);
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config = NodeConfig::from_json(
            r#"{"broker":{"host":"broker.local","port":8883},"duty_cycle":{"ready_samples":3}}"#,
        )
        .unwrap();

        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.client_id, "senseclima-00001");
        assert_eq!(config.duty_cycle.ready_samples, 3);
        assert_eq!(config.duty_cycle.failure_threshold, 60);
    }

    #[test]
    fn sanitize_repairs_unusable_values() {
        let mut config = NodeConfig::default();
        config.broker.host = "  ".to_string();
        config.broker.port = 0;
        config.duty_cycle.ready_samples = 0;
        config.duty_cycle.inbound_queue_depth = 0;
        config.duty_cycle.poller_stack_size = 0;
        config.duty_cycle.default_interval_ms = MAX_INTERVAL_MS + 1;

        config.sanitize();

        assert_eq!(config.broker.host, "test.mosquitto.org");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.duty_cycle.ready_samples, 1);
        assert_eq!(config.duty_cycle.inbound_queue_depth, 1);
        assert_eq!(config.duty_cycle.poller_stack_size, MIN_STACK_SIZE);
        assert_eq!(config.duty_cycle.default_interval_ms, DEFAULT_INTERVAL_MS);
    }

    #[cfg(not(target_os = "espidf"))]
    #[test]
    fn host_threads_get_room_for_the_mqtt_runtime() {
        let config = DutyCycleConfig::default();

        assert!(config.poller_stack_size >= 32 * 1024);
        assert!(config.duty_cycle_stack_size >= 32 * 1024);
    }

    #[test]
    fn sleep_mode_parses_from_json() {
        let config =
            NodeConfig::from_json(r#"{"duty_cycle":{"sleep_mode":"SLEEP2"}}"#).unwrap();
        assert_eq!(config.duty_cycle.sleep_mode, SleepMode::Sleep2);
    }
}
