use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ConfigError,
    pins::HvacPinSet,
    schedule::{hhmm_to_minute, NamedSetting, SeasonCalendar, SeasonSchedule, TimeWindow},
    sensors::{SensorGroup, SensorSpec},
    types::Season,
};

/// `[driverType, pinOrChannel]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSensor(pub String, pub u8);

/// `[startHHMM, endHHMM, adjustment]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTimeSetting(pub u16, pub u16, pub f32);

/// `[_, _, adjustment]`; the leading entries are carried but unused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNamedSetting(pub Value, pub Value, pub f32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSeason {
    #[serde(rename = "defaultTemp", default)]
    pub default_temp_f: Option<f32>,
    #[serde(rename = "timeSettings", default)]
    pub time_settings: BTreeMap<String, RawTimeSetting>,
    #[serde(rename = "namedSettings", default)]
    pub named_settings: BTreeMap<String, RawNamedSetting>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempSettings {
    #[serde(rename = "defaultTemp", default)]
    pub default_temp_f: Option<f32>,
    #[serde(rename = "WINTER", default, skip_serializing_if = "Option::is_none")]
    pub winter: Option<RawSeason>,
    #[serde(rename = "SUMMER", default, skip_serializing_if = "Option::is_none")]
    pub summer: Option<RawSeason>,
}

impl TempSettings {
    pub fn season(&self, season: Season) -> Option<&RawSeason> {
        match season {
            Season::Winter => self.winter.as_ref(),
            Season::Summer => self.summer.as_ref(),
        }
    }
}

/// Control-loop constants that the schedule data does not carry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlTuning {
    pub hysteresis_low_f: f32,
    pub hysteresis_high_f: f32,
    pub min_dwell_ms: u64,
    pub sensor_stale_timeout_ms: u64,
    pub sense_timeout_ms: u64,
    pub sense_poll_ms: u64,
    pub pulse_ms: u64,
    pub poll_interval_ms: u64,
    pub min_valid_temp_f: f32,
    pub max_valid_temp_f: f32,
}

impl Default for ControlTuning {
    fn default() -> Self {
        Self {
            hysteresis_low_f: 1.0,
            hysteresis_high_f: 1.0,
            min_dwell_ms: 300_000,
            sensor_stale_timeout_ms: 300_000,
            sense_timeout_ms: 2_000,
            sense_poll_ms: 50,
            pulse_ms: 100,
            poll_interval_ms: 10_000,
            min_valid_temp_f: -40.0,
            max_valid_temp_f: 150.0,
        }
    }
}

impl ControlTuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.hysteresis_low_f.is_finite() && self.hysteresis_low_f > 0.0) {
            return Err(ConfigError::InvalidTuning {
                field: "hysteresisLowF",
                reason: "must be a positive number",
            });
        }
        if !(self.hysteresis_high_f.is_finite() && self.hysteresis_high_f > 0.0) {
            return Err(ConfigError::InvalidTuning {
                field: "hysteresisHighF",
                reason: "must be a positive number",
            });
        }
        if self.sense_poll_ms == 0 {
            return Err(ConfigError::InvalidTuning {
                field: "sensePollMs",
                reason: "must be at least 1",
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidTuning {
                field: "pollIntervalMs",
                reason: "must be at least 1",
            });
        }
        if !(self.min_valid_temp_f < self.max_valid_temp_f) {
            return Err(ConfigError::InvalidTuning {
                field: "minValidTempF",
                reason: "must be below maxValidTempF",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HvacSection {
    #[serde(rename = "controlPins")]
    pub control_pins: HvacPinSet,
    #[serde(rename = "sensorGroup", default)]
    pub sensor_group: Option<String>,
    #[serde(default)]
    pub tuning: ControlTuning,
}

fn default_seasons() -> BTreeMap<Season, Vec<u32>> {
    let mut seasons = BTreeMap::new();
    seasons.insert(Season::Winter, vec![11, 12, 1, 2, 3]);
    seasons.insert(Season::Summer, vec![7, 8, 9]);
    seasons
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

/// The configuration file as written on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub sensors: BTreeMap<String, RawSensor>,
    #[serde(rename = "sensorGroups")]
    pub sensor_groups: BTreeMap<String, Vec<String>>,
    #[serde(rename = "tempSettings")]
    pub temp_settings: TempSettings,
    pub hvac: HvacSection,
    #[serde(default = "default_seasons")]
    pub seasons: BTreeMap<Season, Vec<u32>>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(rename = "activeOverride", default)]
    pub active_override: Option<String>,
}

impl RuntimeConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }
}

fn time_settings(entries: &[(&str, u16, u16, f32)]) -> BTreeMap<String, RawTimeSetting> {
    entries
        .iter()
        .map(|(name, start, end, adjustment)| {
            (
                name.to_string(),
                RawTimeSetting(*start, *end, *adjustment),
            )
        })
        .collect()
}

fn named_settings(entries: &[(&str, f32)]) -> BTreeMap<String, RawNamedSetting> {
    entries
        .iter()
        .map(|(name, adjustment)| {
            (
                name.to_string(),
                RawNamedSetting(Value::from(0), Value::from(0), *adjustment),
            )
        })
        .collect()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let sensors = ["HALLWAY", "MASTERBED", "LIVINGROOM"]
            .iter()
            .enumerate()
            .map(|(channel, name)| {
                (
                    name.to_string(),
                    RawSensor("TMP36".to_string(), channel as u8),
                )
            })
            .collect();

        let mut sensor_groups = BTreeMap::new();
        sensor_groups.insert(
            "HOUSE".to_string(),
            vec![
                "HALLWAY".to_string(),
                "MASTERBED".to_string(),
                "LIVINGROOM".to_string(),
            ],
        );

        let winter = RawSeason {
            default_temp_f: Some(68.0),
            time_settings: time_settings(&[
                ("TIME_ONE", 600, 730, 2.0),
                ("TIME_TWO", 730, 1700, 0.0),
                ("TIME_THREE", 1700, 2200, 1.0),
                ("TIME_FOUR", 2200, 600, -2.0),
            ]),
            named_settings: named_settings(&[("HOME", 0.0), ("AWAY", -3.0)]),
        };
        let summer = RawSeason {
            default_temp_f: Some(76.0),
            time_settings: time_settings(&[
                ("TIME_ONE", 600, 900, 0.0),
                ("TIME_TWO", 900, 1700, 2.0),
                ("TIME_THREE", 1700, 2030, -1.0),
                ("TIME_FOUR", 2030, 600, 0.0),
            ]),
            named_settings: named_settings(&[("HOME", 0.0), ("AWAY", 4.0)]),
        };

        Self {
            sensors,
            sensor_groups,
            temp_settings: TempSettings {
                default_temp_f: Some(70.0),
                winter: Some(winter),
                summer: Some(summer),
            },
            hvac: HvacSection {
                control_pins: HvacPinSet::default(),
                sensor_group: Some("HOUSE".to_string()),
                tuning: ControlTuning::default(),
            },
            seasons: default_seasons(),
            timezone: default_timezone(),
            active_override: None,
        }
    }
}

/// Validated, immutable configuration snapshot shared by every core component.
#[derive(Debug, Clone, PartialEq)]
pub struct HvacConfig {
    sensors: BTreeMap<String, SensorSpec>,
    groups: BTreeMap<String, SensorGroup>,
    control_group: String,
    seasons: BTreeMap<Season, SeasonSchedule>,
    calendar: SeasonCalendar,
    pins: HvacPinSet,
    tuning: ControlTuning,
    timezone: String,
    active_override: Option<String>,
}

impl HvacConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Self::from_runtime(RuntimeConfig::from_json(raw)?)
    }

    pub fn from_runtime(runtime: RuntimeConfig) -> Result<Self, ConfigError> {
        runtime.hvac.tuning.validate()?;

        let sensors: BTreeMap<String, SensorSpec> = runtime
            .sensors
            .into_iter()
            .map(|(name, RawSensor(driver, channel))| (name, SensorSpec { driver, channel }))
            .collect();

        let mut groups = BTreeMap::new();
        for (name, members) in runtime.sensor_groups {
            if members.is_empty() {
                return Err(ConfigError::EmptyGroup(name));
            }
            if let Some(unknown) = members.iter().find(|member| !sensors.contains_key(*member)) {
                return Err(ConfigError::UnknownSensor {
                    group: name,
                    sensor: unknown.clone(),
                });
            }
            groups.insert(name.clone(), SensorGroup::new(name, members));
        }

        let control_group = match runtime.hvac.sensor_group {
            Some(name) if groups.contains_key(&name) => name,
            Some(name) => return Err(ConfigError::UnknownGroup(name)),
            None if groups.len() == 1 => groups.keys().next().cloned().unwrap_or_default(),
            None => return Err(ConfigError::AmbiguousGroup(groups.len())),
        };

        let mut seasons = BTreeMap::new();
        for season in Season::ALL {
            let Some(raw) = runtime.temp_settings.season(season) else {
                continue;
            };
            let default_temp_f = raw
                .default_temp_f
                .or(runtime.temp_settings.default_temp_f)
                .ok_or(ConfigError::MissingDefaultTemp { season })?;
            seasons.insert(season, build_season(season, default_temp_f, raw)?);
        }

        let calendar = SeasonCalendar::new(&runtime.seasons)?;
        if let Some((month, season)) = calendar
            .assigned_months()
            .find(|(_, season)| !seasons.contains_key(season))
        {
            return Err(ConfigError::MissingSeason { month, season });
        }

        let pins = runtime.hvac.control_pins;
        pins.validate()?;

        Ok(Self {
            sensors,
            groups,
            control_group,
            seasons,
            calendar,
            pins,
            tuning: runtime.hvac.tuning,
            timezone: runtime.timezone,
            active_override: runtime
                .active_override
                .map(|name| name.to_ascii_uppercase()),
        })
    }

    pub fn sensor(&self, name: &str) -> Option<&SensorSpec> {
        self.sensors.get(name)
    }

    pub fn sensors(&self) -> impl Iterator<Item = (&str, &SensorSpec)> {
        self.sensors.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn group(&self, name: &str) -> Option<&SensorGroup> {
        self.groups.get(name)
    }

    /// The group whose aggregate drives the HVAC.
    pub fn control_group(&self) -> &SensorGroup {
        &self.groups[&self.control_group]
    }

    pub fn season(&self, season: Season) -> Option<&SeasonSchedule> {
        self.seasons.get(&season)
    }

    pub fn calendar(&self) -> &SeasonCalendar {
        &self.calendar
    }

    pub fn pins(&self) -> &HvacPinSet {
        &self.pins
    }

    pub fn tuning(&self) -> &ControlTuning {
        &self.tuning
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn active_override(&self) -> Option<&str> {
        self.active_override.as_deref()
    }
}

fn build_season(
    season: Season,
    default_temp_f: f32,
    raw: &RawSeason,
) -> Result<SeasonSchedule, ConfigError> {
    let windows = raw
        .time_settings
        .iter()
        .map(|(name, RawTimeSetting(start, end, adjustment))| {
            Ok(TimeWindow {
                name: name.clone(),
                start: hhmm_to_minute(*start)?,
                end: hhmm_to_minute(*end)?,
                adjustment: *adjustment,
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    let named = raw
        .named_settings
        .iter()
        .map(|(name, RawNamedSetting(_, _, adjustment))| NamedSetting {
            name: name.to_ascii_uppercase(),
            adjustment: *adjustment,
        })
        .collect();

    SeasonSchedule::new(season, default_temp_f, windows, named)
}
