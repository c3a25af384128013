use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use serde::Serialize;

use crate::{
    error::{ConfigError, ScheduleError},
    types::Season,
};

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Converts a four-digit `HHMM` value (1830 = 18:30) into minute-of-day.
pub fn hhmm_to_minute(value: u16) -> Result<u16, ConfigError> {
    let hour = value / 100;
    let minute = value % 100;
    if hour >= 24 || minute >= 60 {
        return Err(ConfigError::InvalidTime { value });
    }
    Ok(hour * 60 + minute)
}

pub fn minute_of_day(now: &DateTime<FixedOffset>) -> u16 {
    (now.hour() * 60 + now.minute()) as u16
}

/// Half-open `[start, end)` range of minutes. `end < start` wraps midnight and
/// `start == end` covers the whole day.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub name: String,
    pub start: u16,
    pub end: u16,
    pub adjustment: f32,
}

impl TimeWindow {
    pub fn contains(&self, minute: u16) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= minute && minute < self.end
        } else {
            minute >= self.start || minute < self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedSetting {
    pub name: String,
    pub adjustment: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "camelCase")]
pub enum AdjustmentSource {
    Override(String),
    Window(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub adjustment: f32,
    pub source: AdjustmentSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeasonSchedule {
    season: Season,
    default_temp_f: f32,
    windows: Vec<TimeWindow>,
    named_settings: BTreeMap<String, NamedSetting>,
}

impl SeasonSchedule {
    /// Builds a season schedule, rejecting window sets that do not cover the
    /// day exactly once.
    pub fn new(
        season: Season,
        default_temp_f: f32,
        mut windows: Vec<TimeWindow>,
        named_settings: Vec<NamedSetting>,
    ) -> Result<Self, ConfigError> {
        windows.sort_by_key(|window| window.start);
        validate_partition(season, &windows)?;

        let named_settings = named_settings
            .into_iter()
            .map(|setting| (setting.name.to_ascii_uppercase(), setting))
            .collect();

        Ok(Self {
            season,
            default_temp_f,
            windows,
            named_settings,
        })
    }

    pub fn season(&self) -> Season {
        self.season
    }

    pub fn default_temp_f(&self) -> f32 {
        self.default_temp_f
    }

    pub fn windows(&self) -> &[TimeWindow] {
        &self.windows
    }

    pub fn named_setting(&self, name: &str) -> Option<&NamedSetting> {
        self.named_settings.get(&name.to_ascii_uppercase())
    }

    /// Returns the adjustment in effect at `minute`. An active override that
    /// exists for this season wins over every time window.
    pub fn resolve(
        &self,
        minute: u16,
        active_override: Option<&str>,
    ) -> Result<Resolution, ScheduleError> {
        if let Some(setting) = active_override.and_then(|name| self.named_setting(name)) {
            return Ok(Resolution {
                adjustment: setting.adjustment,
                source: AdjustmentSource::Override(setting.name.clone()),
            });
        }

        self.windows
            .iter()
            .find(|window| window.contains(minute))
            .map(|window| Resolution {
                adjustment: window.adjustment,
                source: AdjustmentSource::Window(window.name.clone()),
            })
            .ok_or(ScheduleError::Gap {
                season: self.season,
                minute,
            })
    }
}

fn validate_partition(season: Season, windows: &[TimeWindow]) -> Result<(), ConfigError> {
    for minute in 0..MINUTES_PER_DAY {
        let mut matching = windows.iter().filter(|window| window.contains(minute));
        let Some(first) = matching.next() else {
            return Err(ConfigError::ScheduleGap { season, minute });
        };
        if let Some(second) = matching.next() {
            return Err(ConfigError::ScheduleOverlap {
                season,
                first: first.name.clone(),
                second: second.name.clone(),
                minute,
            });
        }
    }
    Ok(())
}

/// Month-to-season lookup. Months without a season are shoulder months.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeasonCalendar {
    months: [Option<Season>; 12],
}

impl SeasonCalendar {
    pub fn new(assignments: &BTreeMap<Season, Vec<u32>>) -> Result<Self, ConfigError> {
        let mut months = [None; 12];
        for (season, season_months) in assignments {
            for &month in season_months {
                if !(1..=12).contains(&month) {
                    return Err(ConfigError::InvalidMonth(month));
                }
                let slot = &mut months[(month - 1) as usize];
                if slot.is_some() {
                    return Err(ConfigError::DuplicateMonth { month });
                }
                *slot = Some(*season);
            }
        }
        Ok(Self { months })
    }

    pub fn season_for_month(&self, month: u32) -> Option<Season> {
        month
            .checked_sub(1)
            .and_then(|index| self.months.get(index as usize).copied().flatten())
    }

    pub fn season_at(&self, now: &DateTime<FixedOffset>) -> Option<Season> {
        self.season_for_month(now.month())
    }

    pub fn assigned_months(&self) -> impl Iterator<Item = (u32, Season)> + '_ {
        self.months
            .iter()
            .enumerate()
            .filter_map(|(index, season)| season.map(|season| (index as u32 + 1, season)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(name: &str, start: u16, end: u16, adjustment: f32) -> TimeWindow {
        TimeWindow {
            name: name.to_string(),
            start: hhmm_to_minute(start).unwrap(),
            end: hhmm_to_minute(end).unwrap(),
            adjustment,
        }
    }

    fn winter() -> SeasonSchedule {
        SeasonSchedule::new(
            Season::Winter,
            68.0,
            vec![
                window("TIME_ONE", 600, 730, 2.0),
                window("TIME_TWO", 730, 1700, 0.0),
                window("TIME_THREE", 1700, 2200, 1.0),
                window("TIME_FOUR", 2200, 600, -2.0),
            ],
            vec![NamedSetting {
                name: "AWAY".to_string(),
                adjustment: -3.0,
            }],
        )
        .unwrap()
    }

    #[test]
    fn converts_hhmm_to_minute_of_day() {
        assert_eq!(hhmm_to_minute(0).unwrap(), 0);
        assert_eq!(hhmm_to_minute(600).unwrap(), 360);
        assert_eq!(hhmm_to_minute(1830).unwrap(), 1_110);
        assert_eq!(hhmm_to_minute(2359).unwrap(), 1_439);
        assert_eq!(
            hhmm_to_minute(2400),
            Err(ConfigError::InvalidTime { value: 2400 })
        );
        assert_eq!(
            hhmm_to_minute(1275),
            Err(ConfigError::InvalidTime { value: 1275 })
        );
    }

    #[test]
    fn wrapping_window_contains_both_sides_of_midnight() {
        let late = window("LATE", 2030, 600, 0.0);

        assert!(late.contains(hhmm_to_minute(2030).unwrap()));
        assert!(late.contains(hhmm_to_minute(2300).unwrap()));
        assert!(late.contains(0));
        assert!(late.contains(hhmm_to_minute(559).unwrap()));
        assert!(!late.contains(hhmm_to_minute(600).unwrap()));
        assert!(!late.contains(hhmm_to_minute(1200).unwrap()));
    }

    #[test]
    fn equal_bounds_cover_the_whole_day() {
        let all_day = window("ALL", 0, 0, 1.0);
        assert!((0..MINUTES_PER_DAY).all(|minute| all_day.contains(minute)));
    }

    #[test]
    fn resolves_window_by_minute() {
        let schedule = winter();
        let resolution = schedule.resolve(hhmm_to_minute(630).unwrap(), None).unwrap();

        assert_eq!(resolution.adjustment, 2.0);
        assert_eq!(
            resolution.source,
            AdjustmentSource::Window("TIME_ONE".to_string())
        );
    }

    #[test]
    fn end_minute_is_exclusive() {
        let schedule = winter();
        let resolution = schedule.resolve(hhmm_to_minute(730).unwrap(), None).unwrap();

        assert_eq!(
            resolution.source,
            AdjustmentSource::Window("TIME_TWO".to_string())
        );
    }

    #[test]
    fn override_wins_at_every_minute() {
        let schedule = winter();
        for minute in 0..MINUTES_PER_DAY {
            let resolution = schedule.resolve(minute, Some("away")).unwrap();
            assert_eq!(resolution.adjustment, -3.0);
            assert_eq!(
                resolution.source,
                AdjustmentSource::Override("AWAY".to_string())
            );
        }
    }

    #[test]
    fn unknown_override_falls_back_to_windows() {
        let schedule = winter();
        let resolution = schedule
            .resolve(hhmm_to_minute(1800).unwrap(), Some("VACATION"))
            .unwrap();

        assert_eq!(resolution.adjustment, 1.0);
    }

    #[test]
    fn rejects_gap_in_windows() {
        let result = SeasonSchedule::new(
            Season::Summer,
            76.0,
            vec![
                window("MORNING", 600, 1200, 0.0),
                window("NIGHT", 1300, 600, 0.0),
            ],
            Vec::new(),
        );

        assert_eq!(
            result,
            Err(ConfigError::ScheduleGap {
                season: Season::Summer,
                minute: 720,
            })
        );
    }

    #[test]
    fn rejects_overlapping_windows() {
        let result = SeasonSchedule::new(
            Season::Winter,
            68.0,
            vec![
                window("DAY", 600, 1800, 0.0),
                window("EVENING", 1700, 600, 0.0),
            ],
            Vec::new(),
        );

        assert_eq!(
            result,
            Err(ConfigError::ScheduleOverlap {
                season: Season::Winter,
                first: "DAY".to_string(),
                second: "EVENING".to_string(),
                minute: 1_020,
            })
        );
    }

    #[test]
    fn calendar_maps_months_and_leaves_shoulders_empty() {
        let mut assignments = BTreeMap::new();
        assignments.insert(Season::Winter, vec![11, 12, 1, 2, 3]);
        assignments.insert(Season::Summer, vec![7, 8, 9]);
        let calendar = SeasonCalendar::new(&assignments).unwrap();

        assert_eq!(calendar.season_for_month(1), Some(Season::Winter));
        assert_eq!(calendar.season_for_month(8), Some(Season::Summer));
        assert_eq!(calendar.season_for_month(5), None);
        assert_eq!(calendar.season_for_month(0), None);
        assert_eq!(calendar.season_for_month(13), None);
    }

    #[test]
    fn calendar_rejects_month_in_two_seasons() {
        let mut assignments = BTreeMap::new();
        assignments.insert(Season::Winter, vec![3]);
        assignments.insert(Season::Summer, vec![3]);

        assert_eq!(
            SeasonCalendar::new(&assignments),
            Err(ConfigError::DuplicateMonth { month: 3 })
        );
    }
}
