use core::fmt;

use serde::{Deserialize, Serialize};

use crate::topics::SENSOR_FAULT_PAYLOAD;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Tenths(i32);

impl Tenths {
    pub const fn new(tenths: i32) -> Self {
        Self(tenths)
    }

    /// Rounds to the nearest tenth so `25.3_f32` stays `25.3` instead of
    /// truncating to `25.2`.
    pub fn from_f32(value: f32) -> Self {
        Self((value * 10.0).round() as i32)
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Tenths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{}", abs / 10, abs % 10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSample {
    pub temperature: Tenths,
    pub humidity: Tenths,
}

impl SensorSample {
    pub fn from_f32(temperature_c: f32, humidity: f32) -> Self {
        Self {
            temperature: Tenths::from_f32(temperature_c),
            humidity: Tenths::from_f32(humidity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Telemetry {
    Reading(SensorSample),
    SensorFault,
}

impl Telemetry {
    pub fn temperature_payload(&self) -> String {
        match self {
            Self::Reading(sample) => sample.temperature.to_string(),
            Self::SensorFault => SENSOR_FAULT_PAYLOAD.to_string(),
        }
    }

    pub fn humidity_payload(&self) -> String {
        match self {
            Self::Reading(sample) => sample.humidity.to_string(),
            Self::SensorFault => SENSOR_FAULT_PAYLOAD.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SleepMode {
    Sleep1,
    Sleep2,
    #[default]
    Hibernate,
}

impl SleepMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sleep1 => "SLEEP1",
            Self::Sleep2 => "SLEEP2",
            Self::Hibernate => "HIBERNATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}
