use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};
use hvac_common::{
    config::RuntimeConfig,
    pins::sim::RelayBoard,
    schedule::MINUTES_PER_DAY,
    sensors::aggregate,
    AdjustmentSource, Controller, Exclusion, FaultKind, HvacConfig, HvacMode, HvacPins, PinLevel,
    Season, SensorDriver, SensorError, SensorReading,
};
use pretty_assertions::assert_eq;

/// Sensor driver with a scripted answer per sensor.
#[derive(Default)]
struct ScriptedSensors {
    answers: HashMap<String, Result<SensorReading, SensorError>>,
}

impl ScriptedSensors {
    fn reading(mut self, sensor: &str, value_f: f32, timestamp_ms: u64) -> Self {
        self.answers.insert(
            sensor.to_string(),
            Ok(SensorReading {
                sensor_id: sensor.to_string(),
                value_f,
                timestamp_ms,
                valid: true,
            }),
        );
        self
    }

    fn timeout(mut self, sensor: &str) -> Self {
        self.answers
            .insert(sensor.to_string(), Err(SensorError::Timeout(sensor.to_string())));
        self
    }

    fn house(value_f: f32, timestamp_ms: u64) -> Self {
        Self::default()
            .reading("HALLWAY", value_f, timestamp_ms)
            .reading("MASTERBED", value_f, timestamp_ms)
            .reading("LIVINGROOM", value_f, timestamp_ms)
    }
}

impl SensorDriver for ScriptedSensors {
    fn read(&self, sensor_id: &str) -> Result<SensorReading, SensorError> {
        self.answers
            .get(sensor_id)
            .cloned()
            .unwrap_or_else(|| Err(SensorError::Unavailable(sensor_id.to_string())))
    }
}

fn config_with(hysteresis_high_f: f32, min_dwell_ms: u64) -> Arc<HvacConfig> {
    let mut runtime = RuntimeConfig::default();
    runtime.hvac.tuning.hysteresis_high_f = hysteresis_high_f;
    runtime.hvac.tuning.min_dwell_ms = min_dwell_ms;
    runtime.hvac.tuning.pulse_ms = 0;
    runtime.hvac.tuning.sense_timeout_ms = 0;
    Arc::new(HvacConfig::from_runtime(runtime).unwrap())
}

fn household() -> Arc<HvacConfig> {
    config_with(1.0, 300_000)
}

fn at(month: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
    let naive = NaiveDate::from_ymd_opt(2024, month, 10)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap();
    FixedOffset::west_opt(5 * 3600)
        .unwrap()
        .from_local_datetime(&naive)
        .unwrap()
}

#[test]
fn every_season_covers_each_minute_exactly_once() {
    let config = household();

    for season in Season::ALL {
        let schedule = config.season(season).unwrap();
        for minute in 0..MINUTES_PER_DAY {
            let matches = schedule
                .windows()
                .iter()
                .filter(|window| window.contains(minute))
                .count();
            assert_eq!(matches, 1, "{season} minute {minute}");
        }
    }
}

#[test]
fn midnight_wrap_window_covers_both_sides() {
    let config = household();
    let winter = config.season(Season::Winter).unwrap();

    for minute in [22 * 60, 23 * 60 + 59, 0, 5 * 60 + 59] {
        let resolution = winter.resolve(minute, None).unwrap();
        assert_eq!(
            resolution.source,
            AdjustmentSource::Window("TIME_FOUR".to_string())
        );
        assert_eq!(resolution.adjustment, -2.0);
    }
    let morning = winter.resolve(6 * 60, None).unwrap();
    assert_eq!(
        morning.source,
        AdjustmentSource::Window("TIME_ONE".to_string())
    );
}

#[test]
fn active_override_wins_at_every_minute() {
    let config = household();

    for season in Season::ALL {
        let schedule = config.season(season).unwrap();
        let away = schedule.named_setting("AWAY").unwrap().adjustment;
        for minute in (0..MINUTES_PER_DAY).step_by(7) {
            let resolution = schedule.resolve(minute, Some("AWAY")).unwrap();
            assert_eq!(resolution.adjustment, away);
            assert_eq!(
                resolution.source,
                AdjustmentSource::Override("AWAY".to_string())
            );
        }
    }
}

#[test]
fn winter_half_past_six_targets_seventy() {
    let mut controller = Controller::new(household());
    let mut board = RelayBoard::new(*controller.config().pins());

    let record = controller.run_cycle(
        &ScriptedSensors::house(70.0, 0),
        &mut board,
        0,
        at(1, 6, 30),
    );

    let target = record.target.unwrap();
    assert_eq!(target.season, Season::Winter);
    assert_eq!(target.default_temp_f, 68.0);
    assert_eq!(target.adjustment, 2.0);
    assert_eq!(target.target_f, 70.0);
}

#[test]
fn winter_noon_away_targets_sixty_five() {
    let mut controller = Controller::new(household());
    controller.set_active_override(Some("AWAY"));
    let mut board = RelayBoard::new(*controller.config().pins());

    let record = controller.run_cycle(
        &ScriptedSensors::house(65.0, 0),
        &mut board,
        0,
        at(2, 12, 0),
    );

    assert_eq!(record.target.map(|target| target.target_f), Some(65.0));
    assert_eq!(record.new_state, HvacMode::Off);
}

#[test]
fn summer_late_evening_targets_default() {
    let mut controller = Controller::new(household());
    let mut board = RelayBoard::new(*controller.config().pins());

    let record = controller.run_cycle(
        &ScriptedSensors::house(76.0, 0),
        &mut board,
        0,
        at(8, 23, 0),
    );

    let target = record.target.unwrap();
    assert_eq!(target.season, Season::Summer);
    assert_eq!(target.target_f, 76.0);
}

#[test]
fn degraded_group_averages_remaining_members() {
    let config = household();
    let sensors = ScriptedSensors::default()
        .reading("HALLWAY", 68.0, 0)
        .timeout("MASTERBED")
        .reading("LIVINGROOM", 70.0, 0);

    let result = aggregate(&sensors, config.control_group(), config.tuning(), 0).unwrap();

    assert_eq!(result.temperature_f, 69.0);
    assert!(result.degraded);
    assert_eq!(
        result.excluded,
        vec![Exclusion::ReadFailed {
            sensor: "MASTERBED".to_string(),
            error: "sensor `MASTERBED` did not answer before the read timeout".to_string(),
        }]
    );
}

#[test]
fn degraded_cycle_still_controls() {
    let mut controller = Controller::new(household());
    let mut board = RelayBoard::new(*controller.config().pins());
    let sensors = ScriptedSensors::default()
        .reading("HALLWAY", 60.0, 0)
        .timeout("MASTERBED")
        .reading("LIVINGROOM", 62.0, 0);

    let record = controller.run_cycle(&sensors, &mut board, 0, at(1, 12, 0));

    assert!(record.degraded);
    assert_eq!(record.aggregated_temp_f, Some(61.0));
    assert_eq!(record.fault, None);
    assert_eq!(record.new_state, HvacMode::Heating);
}

#[test]
fn all_sensors_failed_forces_off() {
    let config = household();
    let pins = *config.pins();
    let mut controller = Controller::new(config);
    let mut board = RelayBoard::new(pins);

    controller.run_cycle(&ScriptedSensors::house(80.0, 0), &mut board, 0, at(8, 12, 0));
    assert!(board.cool_engaged());

    let failed = ScriptedSensors::default()
        .timeout("HALLWAY")
        .timeout("MASTERBED")
        .timeout("LIVINGROOM");
    let record = controller.run_cycle(&failed, &mut board, 1_000, at(8, 12, 0));

    assert_eq!(record.fault, Some(FaultKind::NoSensorData));
    assert_eq!(record.aggregated_temp_f, None);
    assert_eq!(record.previous_state, HvacMode::Cooling);
    assert_eq!(record.new_state, HvacMode::Off);
    assert!(!board.cool_engaged());
    assert_eq!(board.read(pins.cool_sense), Ok(PinLevel::Low));
    assert_eq!(board.read(pins.heat_sense), Ok(PinLevel::Low));
}

#[test]
fn dwell_blocks_leaving_an_active_mode() {
    let mut controller = Controller::new(config_with(1.0, 60_000));
    let mut board = RelayBoard::new(*controller.config().pins());

    controller.run_cycle(&ScriptedSensors::house(60.0, 0), &mut board, 0, at(1, 12, 0));
    let early = controller.run_cycle(
        &ScriptedSensors::house(75.0, 59_000),
        &mut board,
        59_000,
        at(1, 12, 1),
    );
    assert_eq!(early.new_state, HvacMode::Heating);
    assert_eq!(controller.status(59_000).dwell_remaining_ms, 1_000);

    let settled = controller.run_cycle(
        &ScriptedSensors::house(75.0, 60_000),
        &mut board,
        60_000,
        at(1, 12, 1),
    );
    assert_eq!(settled.new_state, HvacMode::Off);
    assert_eq!(controller.status(60_000).heating_runs, 1);
}

#[test]
fn cooling_run_ends_at_target_after_dwell() {
    let mut runtime = RuntimeConfig::default();
    runtime.temp_settings.summer.as_mut().unwrap().default_temp_f = Some(70.0);
    runtime.hvac.tuning.hysteresis_high_f = 1.0;
    runtime.hvac.tuning.min_dwell_ms = 30_000;
    runtime.hvac.tuning.pulse_ms = 0;
    runtime.hvac.tuning.sense_timeout_ms = 0;
    let mut controller = Controller::new(Arc::new(HvacConfig::from_runtime(runtime).unwrap()));
    let mut board = RelayBoard::new(*controller.config().pins());

    let engaged = controller.run_cycle(
        &ScriptedSensors::house(72.0, 0),
        &mut board,
        0,
        at(7, 23, 0),
    );
    assert_eq!(engaged.target.as_ref().map(|t| t.target_f), Some(70.0));
    assert_eq!(engaged.new_state, HvacMode::Cooling);
    assert!(board.cool_engaged());

    let still = controller.run_cycle(
        &ScriptedSensors::house(70.0, 10_000),
        &mut board,
        10_000,
        at(7, 23, 0),
    );
    assert_eq!(still.new_state, HvacMode::Cooling);

    let done = controller.run_cycle(
        &ScriptedSensors::house(70.0, 30_000),
        &mut board,
        30_000,
        at(7, 23, 1),
    );
    assert_eq!(done.new_state, HvacMode::Off);
    assert!(!board.cool_engaged());
    assert_eq!(controller.status(30_000).cooling_runs, 1);
}

#[test]
fn sense_mismatch_ends_in_off_with_both_outputs_released() {
    let config = household();
    let pins = *config.pins();
    let mut controller = Controller::new(config);
    let mut board = RelayBoard::new(pins);
    board.stick(pins.cool_sense, PinLevel::Low);

    let record = controller.run_cycle(
        &ScriptedSensors::house(85.0, 0),
        &mut board,
        0,
        at(8, 12, 0),
    );

    assert_eq!(record.fault, Some(FaultKind::ActuationFault));
    assert_eq!(record.new_state, HvacMode::Off);
    assert!(record.fault_latched);
    // startup release plus the post-fault release
    assert_eq!(board.pulses(pins.heat_off), 2);
    assert_eq!(board.pulses(pins.cool_off), 2);
    assert!(!board.heat_engaged());
    assert!(!board.cool_engaged());
}

#[test]
fn pin_timeout_is_treated_as_actuation_fault() {
    let config = household();
    let pins = *config.pins();
    let mut controller = Controller::new(config);
    let mut board = RelayBoard::new(pins);
    controller.run_cycle(&ScriptedSensors::house(68.0, 0), &mut board, 0, at(12, 12, 0));
    board.fail_reads(pins.heat_sense);

    let record = controller.run_cycle(
        &ScriptedSensors::house(55.0, 1_000),
        &mut board,
        1_000,
        at(12, 12, 1),
    );

    assert_eq!(record.fault, Some(FaultKind::ActuationFault));
    assert_eq!(record.new_state, HvacMode::Off);
    assert!(!board.heat_engaged());
}

#[test]
fn restart_with_heat_latched_never_runs_both_relays() {
    let config = household();
    let pins = *config.pins();
    let mut board = RelayBoard::new(pins);
    board.write(pins.heat_on, PinLevel::High).unwrap();
    board.write(pins.heat_on, PinLevel::Low).unwrap();
    let mut controller = Controller::new(config);

    let record = controller.run_cycle(
        &ScriptedSensors::house(85.0, 0),
        &mut board,
        0,
        at(8, 12, 0),
    );

    assert_eq!(record.new_state, HvacMode::Cooling);
    assert_eq!(record.fault, None);
    assert!(!(board.heat_engaged() && board.cool_engaged()));
    assert_eq!(board.read(pins.heat_sense), Ok(PinLevel::Low));
}

#[test]
fn all_sensors_failed_with_cool_sense_stuck_high_latches_fault() {
    let config = household();
    let pins = *config.pins();
    let mut controller = Controller::new(config);
    let mut board = RelayBoard::new(pins);

    controller.run_cycle(&ScriptedSensors::house(80.0, 0), &mut board, 0, at(8, 12, 0));
    assert!(board.cool_engaged());
    board.stick(pins.cool_sense, PinLevel::High);

    let failed = ScriptedSensors::default()
        .timeout("HALLWAY")
        .timeout("MASTERBED")
        .timeout("LIVINGROOM");
    let record = controller.run_cycle(&failed, &mut board, 1_000, at(8, 12, 1));

    assert_eq!(record.previous_state, HvacMode::Cooling);
    assert_eq!(record.new_state, HvacMode::Off);
    assert_eq!(record.fault, Some(FaultKind::ActuationFault));
    assert!(record.fault_latched);
    assert!(record
        .fault_detail
        .as_deref()
        .is_some_and(|detail| detail.starts_with("NO_SENSOR_DATA: ")));
    assert!(!board.cool_engaged());

    board.heal();
    let held = controller.run_cycle(
        &ScriptedSensors::house(80.0, 2_000),
        &mut board,
        2_000,
        at(8, 12, 2),
    );
    assert_eq!(held.new_state, HvacMode::Off);
    assert!(held.fault_latched);
}
