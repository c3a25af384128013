use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use serde::Serialize;

use crate::{config::ControlTuning, error::SensorError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSpec {
    pub driver: String,
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorGroup {
    name: String,
    members: Vec<String>,
}

impl SensorGroup {
    pub fn new(name: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}

/// One reading as produced by the sensor driver, already in °F.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub sensor_id: String,
    pub value_f: f32,
    pub timestamp_ms: u64,
    pub valid: bool,
}

/// Sensor-driver collaborator. `read` is synchronous and bounded by the
/// driver's own timeout; a timeout surfaces as [`SensorError::Timeout`].
pub trait SensorDriver {
    fn read(&self, sensor_id: &str) -> Result<SensorReading, SensorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Exclusion {
    Invalid { sensor: String },
    OutOfRange { sensor: String, value: f32 },
    Stale { sensor: String, age_ms: u64 },
    ReadFailed { sensor: String, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub temperature_f: f32,
    pub degraded: bool,
    pub used: Vec<String>,
    pub excluded: Vec<Exclusion>,
}

/// Reads every member of `group` and averages the usable readings.
///
/// Readings flagged invalid, outside the plausible range, or older than the
/// staleness threshold are excluded. Losing some members only marks the
/// result degraded; losing all of them is [`SensorError::NoSensorData`].
pub fn aggregate<D: SensorDriver + ?Sized>(
    driver: &D,
    group: &SensorGroup,
    tuning: &ControlTuning,
    now_ms: u64,
) -> Result<Aggregate, SensorError> {
    let mut used = Vec::new();
    let mut excluded = Vec::new();
    let mut sum = 0.0_f32;

    for sensor in group.members() {
        let reading = match driver.read(sensor) {
            Ok(reading) => reading,
            Err(err) => {
                excluded.push(Exclusion::ReadFailed {
                    sensor: sensor.clone(),
                    error: err.to_string(),
                });
                continue;
            }
        };

        if !reading.valid || !reading.value_f.is_finite() {
            excluded.push(Exclusion::Invalid {
                sensor: sensor.clone(),
            });
            continue;
        }

        if !(tuning.min_valid_temp_f..=tuning.max_valid_temp_f).contains(&reading.value_f) {
            excluded.push(Exclusion::OutOfRange {
                sensor: sensor.clone(),
                value: reading.value_f,
            });
            continue;
        }

        let age_ms = now_ms.saturating_sub(reading.timestamp_ms);
        if age_ms > tuning.sensor_stale_timeout_ms {
            excluded.push(Exclusion::Stale {
                sensor: sensor.clone(),
                age_ms,
            });
            continue;
        }

        sum += reading.value_f;
        used.push(sensor.clone());
    }

    if used.is_empty() {
        return Err(SensorError::NoSensorData {
            group: group.name().to_string(),
            excluded,
        });
    }

    Ok(Aggregate {
        temperature_f: sum / used.len() as f32,
        degraded: !excluded.is_empty(),
        used,
        excluded,
    })
}

/// Latest reading per sensor, filled asynchronously (MQTT on the controller)
/// and read synchronously by the decision cycle.
///
/// A cache built with [`SensorCache::with_known`] only stores readings from
/// the listed sensors, so foreign publishers cannot grow it.
#[derive(Debug, Clone, Default)]
pub struct SensorCache {
    readings: Arc<Mutex<HashMap<String, SensorReading>>>,
    known: Option<Arc<HashSet<String>>>,
}

impl SensorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known<I, S>(sensor_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            readings: Arc::default(),
            known: Some(Arc::new(sensor_ids.into_iter().map(Into::into).collect())),
        }
    }

    pub fn is_known(&self, sensor_id: &str) -> bool {
        self.known
            .as_ref()
            .map_or(true, |known| known.contains(sensor_id))
    }

    /// Returns `false` when the reading was dropped for an unknown sensor.
    pub fn record(&self, reading: SensorReading) -> bool {
        if !self.is_known(&reading.sensor_id) {
            return false;
        }
        let mut readings = self
            .readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        readings.insert(reading.sensor_id.clone(), reading);
        true
    }

    pub fn len(&self) -> usize {
        self.readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses a raw temperature payload; anything that is not a finite number
    /// is stored as an invalid reading so the sensor counts as failed.
    pub fn record_payload(&self, sensor_id: &str, payload: &str, now_ms: u64) -> bool {
        let parsed = payload.trim().parse::<f32>().ok().filter(|value| value.is_finite());
        self.record(SensorReading {
            sensor_id: sensor_id.to_string(),
            value_f: parsed.unwrap_or(f32::NAN),
            timestamp_ms: now_ms,
            valid: parsed.is_some(),
        })
    }
}

impl SensorDriver for SensorCache {
    fn read(&self, sensor_id: &str) -> Result<SensorReading, SensorError> {
        let readings = self
            .readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        readings
            .get(sensor_id)
            .cloned()
            .ok_or_else(|| SensorError::Unavailable(sensor_id.to_string()))
    }
}
