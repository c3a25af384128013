use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::{
    config::HvacConfig,
    error::{ActuationFault, SensorError},
    hvac::{HvacStateMachine, HvacStatus},
    pins::{self, HvacPins, PinAction},
    schedule::minute_of_day,
    sensors::{self, Exclusion, SensorDriver},
    target::{resolve_target, Target},
    types::{FaultKind, HvacMode, Season},
};

/// Snapshot of one decision cycle, handed to whatever logs or publishes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub season: Option<Season>,
    pub target: Option<Target>,
    #[serde(rename = "aggregatedTempF")]
    pub aggregated_temp_f: Option<f32>,
    pub degraded: bool,
    pub used_sensors: Vec<String>,
    pub excluded: Vec<Exclusion>,
    pub previous_state: HvacMode,
    pub new_state: HvacMode,
    pub fault: Option<FaultKind>,
    pub fault_detail: Option<String>,
    pub fault_latched: bool,
}

impl DecisionRecord {
    pub fn transitioned(&self) -> bool {
        self.previous_state != self.new_state
    }
}

/// Orchestrates one cycle: schedule and sensors in, pin actions out.
///
/// Holds the only mutable HVAC state. Callers serialize access (one cycle at
/// a time) and supply both clocks: `now_ms` is monotonic and drives dwell and
/// staleness, `local` is wall time in the configured timezone and drives the
/// schedule.
pub struct Controller {
    config: Arc<HvacConfig>,
    machine: HvacStateMachine,
    active_override: Option<String>,
    /// Both relays are released and confirmed before the first decision and
    /// again before the first decision after a fault is cleared.
    release_pending: bool,
}

impl Controller {
    pub fn new(config: Arc<HvacConfig>) -> Self {
        let machine = HvacStateMachine::new(*config.pins(), config.tuning());
        let active_override = config.active_override().map(str::to_string);
        Self {
            config,
            machine,
            active_override,
            release_pending: true,
        }
    }

    pub fn config(&self) -> &HvacConfig {
        &self.config
    }

    pub fn active_override(&self) -> Option<&str> {
        self.active_override.as_deref()
    }

    /// Empty input or `NONE` clears the override.
    pub fn set_active_override(&mut self, name: Option<&str>) {
        self.active_override = name
            .map(str::trim)
            .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case("NONE"))
            .map(str::to_ascii_uppercase);
    }

    /// Operator acknowledgement of a latched actuation fault. The next cycle
    /// re-verifies that both relays are released before control resumes.
    pub fn clear_fault(&mut self) {
        if self.machine.is_faulted() {
            self.machine.clear_fault();
            self.release_pending = true;
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.machine.is_faulted()
    }

    pub fn status(&self, now_ms: u64) -> HvacStatus {
        self.machine.status(now_ms)
    }

    pub fn run_cycle<D, P>(
        &mut self,
        sensors: &D,
        pins: &mut P,
        now_ms: u64,
        local: DateTime<FixedOffset>,
    ) -> DecisionRecord
    where
        D: SensorDriver + ?Sized,
        P: HvacPins + ?Sized,
    {
        let config = Arc::clone(&self.config);
        let tuning = config.tuning();
        let previous_state = self.machine.mode();

        let mut record = DecisionRecord {
            timestamp: local,
            season: config.calendar().season_at(&local),
            target: None,
            aggregated_temp_f: None,
            degraded: false,
            used_sensors: Vec::new(),
            excluded: Vec::new(),
            previous_state,
            new_state: previous_state,
            fault: None,
            fault_detail: None,
            fault_latched: false,
        };

        if self.release_pending {
            self.release_pending = false;
            let actions = self.machine.force_off(now_ms);
            if !self.actuate(pins, &actions, now_ms, &mut record) {
                return self.finish(record);
            }
        }

        if let Some(season) = record.season {
            let minute = minute_of_day(&local);
            match resolve_target(&config, season, minute, self.active_override.as_deref()) {
                Ok(target) => record.target = Some(target),
                Err(err) => {
                    let actions = self.machine.force_off(now_ms);
                    record.fault = Some(FaultKind::ScheduleGap);
                    record.fault_detail = Some(err.to_string());
                    self.actuate(pins, &actions, now_ms, &mut record);
                    return self.finish(record);
                }
            }
        }

        let actions = match sensors::aggregate(sensors, config.control_group(), tuning, now_ms) {
            Ok(aggregate) => {
                record.aggregated_temp_f = Some(aggregate.temperature_f);
                record.degraded = aggregate.degraded;
                record.used_sensors = aggregate.used;
                record.excluded = aggregate.excluded;

                let target_f = record.target.as_ref().map(|target| target.target_f);
                self.machine.step(aggregate.temperature_f, target_f, now_ms)
            }
            Err(err) => {
                record.fault_detail = Some(err.to_string());
                if let SensorError::NoSensorData { excluded, .. } = err {
                    record.excluded = excluded;
                }
                record.fault = Some(FaultKind::NoSensorData);
                self.machine.force_off(now_ms)
            }
        };

        self.actuate(pins, &actions, now_ms, &mut record);
        self.finish(record)
    }

    /// Executes `actions`; on failure latches the fault, releases both relays
    /// and returns `false`. An actuation fault takes the record's `fault` slot,
    /// any earlier detail of the same cycle stays in front of its own.
    fn actuate<P: HvacPins + ?Sized>(
        &mut self,
        pins: &mut P,
        actions: &[PinAction],
        now_ms: u64,
        record: &mut DecisionRecord,
    ) -> bool {
        let tuning = *self.config.tuning();
        let Err(fault) = pins::execute(pins, actions, &tuning) else {
            return true;
        };

        let shutdown = self.machine.actuation_fault(now_ms);
        let mut detail = fault.to_string();
        let secondary: Vec<ActuationFault> = pins::execute_best_effort(pins, &shutdown, &tuning);
        if !secondary.is_empty() {
            let extra = secondary
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            detail = format!("{detail} (shutdown: {extra})");
        }

        if let Some(earlier) = record.fault {
            let earlier_detail = record.fault_detail.take().unwrap_or_default();
            detail = format!("{}: {earlier_detail}; {detail}", earlier.as_str());
        }
        record.fault = Some(FaultKind::ActuationFault);
        record.fault_detail = Some(detail);
        false
    }

    fn finish(&self, mut record: DecisionRecord) -> DecisionRecord {
        record.new_state = self.machine.mode();
        record.fault_latched = self.machine.is_faulted();
        record
    }
}
