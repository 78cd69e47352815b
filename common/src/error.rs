use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    #[error("interval must be 8 digits (DDHHMMSS), got {0} characters")]
    Length(usize),
    #[error("non-digit character at position {0}")]
    NonDigit(usize),
    #[error("interval must be greater than zero")]
    Zero,
    #[error("interval of {0} ms exceeds the supported maximum")]
    ExceedsMax(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker did not acknowledge in time")]
    Timeout,
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor did not respond")]
    Timeout,
    #[error("sensor frame checksum mismatch")]
    Checksum,
    #[error("sensor bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PowerError {
    #[error("power control call failed: {0}")]
    Platform(String),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
