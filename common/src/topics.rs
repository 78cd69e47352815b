pub const TOPIC_TEMPERATURE: &str = "hana/externo/senseclima/00001/temperature";
pub const TOPIC_HUMIDITY: &str = "hana/externo/senseclima/00001/humidity";
pub const TOPIC_INTERVAL: &str = "hana/externo/senseclima/00001/interval";

pub const STATUS_ONLINE: &str = "on";

pub const SENSOR_FAULT_PAYLOAD: &str = "error";
