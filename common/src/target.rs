use serde::Serialize;

use crate::{
    config::HvacConfig,
    error::ScheduleError,
    schedule::{AdjustmentSource, SeasonSchedule},
    types::Season,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub season: Season,
    #[serde(rename = "defaultTempF")]
    pub default_temp_f: f32,
    pub adjustment: f32,
    pub source: AdjustmentSource,
    #[serde(rename = "targetF")]
    pub target_f: f32,
}

pub fn compute_target(schedule: &SeasonSchedule, adjustment: f32) -> f32 {
    schedule.default_temp_f() + adjustment
}

/// Resolves the adjustment for `minute` and applies it to the season default.
pub fn resolve_target(
    config: &HvacConfig,
    season: Season,
    minute: u16,
    active_override: Option<&str>,
) -> Result<Target, ScheduleError> {
    let schedule = config
        .season(season)
        .ok_or(ScheduleError::UnknownSeason(season))?;
    let resolution = schedule.resolve(minute, active_override)?;

    Ok(Target {
        season,
        default_temp_f: schedule.default_temp_f(),
        adjustment: resolution.adjustment,
        target_f: compute_target(schedule, resolution.adjustment),
        source: resolution.source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RuntimeConfig, schedule::hhmm_to_minute};

    fn config() -> HvacConfig {
        HvacConfig::from_runtime(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn adds_adjustment_to_season_default() {
        let config = config();
        let summer = config.season(Season::Summer).unwrap();

        assert_eq!(compute_target(summer, 2.0), 78.0);
        assert_eq!(compute_target(summer, -1.0), 75.0);
    }

    #[test]
    fn resolves_winter_evening_target() {
        let target = resolve_target(
            &config(),
            Season::Winter,
            hhmm_to_minute(1900).unwrap(),
            None,
        )
        .unwrap();

        assert_eq!(target.target_f, 69.0);
        assert_eq!(
            target.source,
            AdjustmentSource::Window("TIME_THREE".to_string())
        );
    }

    #[test]
    fn missing_season_is_reported() {
        let mut runtime = RuntimeConfig::default();
        runtime.temp_settings.summer = None;
        runtime.seasons.remove(&Season::Summer);
        let config = HvacConfig::from_runtime(runtime).unwrap();

        assert_eq!(
            resolve_target(&config, Season::Summer, 0, None),
            Err(ScheduleError::UnknownSeason(Season::Summer))
        );
    }
}
