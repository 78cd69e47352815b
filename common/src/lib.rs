pub mod config;
pub mod controller;
pub mod error;
pub mod interval;
pub mod link;
pub mod listener;
pub mod node;
pub mod publisher;
pub mod sleep;
pub mod store;
pub mod supervisor;
pub mod topics;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{BrokerConfig, DutyCycleConfig, NodeConfig};
pub use controller::{CycleState, DutyCycleContext, DutyCycleController, SleepRequest};
pub use error::{IntervalError, LinkError, NodeError, PowerError, SensorError, StorageError};
pub use interval::{ReportingInterval, DEFAULT_INTERVAL_MS, MAX_INTERVAL_MS};
pub use link::{ClimateSensor, MqttLink};
pub use node::{start, Platform};
pub use sleep::{HibernateHooks, PowerControl, SleepScheduler};
pub use store::{IntervalStore, RecordStorage, INTERVAL_RECORD};
pub use topics::*;
pub use types::{ConnectionState, InboundMessage, Qos, SensorSample, SleepMode, Telemetry, Tenths};
