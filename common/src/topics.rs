pub const TOPIC_SENSOR_PREFIX: &str = "hvac/sensor/";
pub const TOPIC_SENSOR_TEMP_FILTER: &str = "hvac/sensor/+/temperature";
pub const TOPIC_SENSOR_STATUS: &str = "hvac/sensor/status";

pub const TOPIC_PRESENCE: &str = "hvac/presence";

pub const TOPIC_CONTROLLER_DECISION: &str = "hvac/controller/decision";
pub const TOPIC_CONTROLLER_FAULT: &str = "hvac/controller/fault";
pub const TOPIC_CONTROLLER_STATUS: &str = "hvac/controller/status";
/// Any publish here acknowledges a latched actuation fault.
pub const TOPIC_CONTROLLER_CLEAR_FAULT: &str = "hvac/controller/clear_fault";

pub fn sensor_temperature_topic(sensor_id: &str) -> String {
    format!("{TOPIC_SENSOR_PREFIX}{sensor_id}/temperature")
}

/// Inverse of [`sensor_temperature_topic`].
pub fn sensor_id_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_SENSOR_PREFIX)?
        .strip_suffix("/temperature")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}
