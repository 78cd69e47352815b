use core::time::Duration;

use crate::{
    error::{LinkError, SensorError},
    types::{InboundMessage, Qos, SensorSample},
};

pub trait MqttLink: Send + Sync {
    fn connect(&self) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), LinkError>;

    fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), LinkError>;

    /// Pumps the session for at most `timeout`, returning the next inbound
    /// publish if one arrived.
    fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, LinkError>;
}

pub trait ClimateSensor {
    fn read(&mut self) -> Result<SensorSample, SensorError>;
}
