use serde::Serialize;

use crate::{
    config::ControlTuning,
    pins::{HvacPinSet, PinAction},
    types::{HvacMode, PinLevel},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HvacState {
    pub mode: HvacMode,
    pub entered_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HvacStatus {
    pub mode: &'static str,
    pub entered_at_ms: u64,
    pub dwell_remaining_ms: u64,
    pub faulted: bool,
    pub heating_runs: u64,
    pub cooling_runs: u64,
}

/// OFF/HEATING/COOLING controller with a hysteresis band and minimum dwell.
///
/// Each decision returns the pin actions that realize it; the caller executes
/// them and reports failures back through [`HvacStateMachine::actuation_fault`].
#[derive(Debug, Clone)]
pub struct HvacStateMachine {
    pins: HvacPinSet,
    hysteresis_low_f: f32,
    hysteresis_high_f: f32,
    min_dwell_ms: u64,

    state: HvacState,
    faulted: bool,
    heating_runs: u64,
    cooling_runs: u64,
}

impl HvacStateMachine {
    pub fn new(pins: HvacPinSet, tuning: &ControlTuning) -> Self {
        Self {
            pins,
            hysteresis_low_f: tuning.hysteresis_low_f,
            hysteresis_high_f: tuning.hysteresis_high_f,
            min_dwell_ms: tuning.min_dwell_ms,
            state: HvacState {
                mode: HvacMode::Off,
                entered_at_ms: 0,
            },
            faulted: false,
            heating_runs: 0,
            cooling_runs: 0,
        }
    }

    pub fn state(&self) -> HvacState {
        self.state
    }

    pub fn mode(&self) -> HvacMode {
        self.state.mode
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn dwell_remaining_ms(&self, now_ms: u64) -> u64 {
        if !self.state.mode.is_active() {
            return 0;
        }
        let elapsed = now_ms.saturating_sub(self.state.entered_at_ms);
        self.min_dwell_ms.saturating_sub(elapsed)
    }

    /// One regular decision. `target_f` is `None` when no schedule applies,
    /// which only ever lets an active mode wind down.
    pub fn step(&mut self, temp_f: f32, target_f: Option<f32>, now_ms: u64) -> Vec<PinAction> {
        let mut actions = Vec::new();

        match self.state.mode {
            HvacMode::Off => {
                if self.faulted {
                    return actions;
                }
                let Some(target_f) = target_f else {
                    return actions;
                };

                if temp_f <= target_f - self.hysteresis_low_f {
                    self.start_heating(now_ms, &mut actions);
                } else if temp_f >= target_f + self.hysteresis_high_f {
                    self.start_cooling(now_ms, &mut actions);
                }
            }
            HvacMode::Heating => {
                if !self.dwell_elapsed(now_ms) {
                    return actions;
                }
                if target_f.map_or(true, |target_f| temp_f >= target_f) {
                    self.stop_heating(now_ms, &mut actions);
                }
            }
            HvacMode::Cooling => {
                if !self.dwell_elapsed(now_ms) {
                    return actions;
                }
                if target_f.map_or(true, |target_f| temp_f <= target_f) {
                    self.stop_cooling(now_ms, &mut actions);
                }
            }
        }

        actions
    }

    /// Safe fallback when the sensor group yields nothing usable. Always
    /// allowed, dwell notwithstanding; both relays are released and confirmed.
    pub fn force_off(&mut self, now_ms: u64) -> Vec<PinAction> {
        self.enter_off(now_ms);
        vec![
            PinAction::Pulse(self.pins.heat_off),
            PinAction::Pulse(self.pins.cool_off),
            PinAction::Confirm {
                commanded: self.pins.heat_off,
                sense: self.pins.heat_sense,
                expected: PinLevel::Low,
            },
            PinAction::Confirm {
                commanded: self.pins.cool_off,
                sense: self.pins.cool_sense,
                expected: PinLevel::Low,
            },
        ]
    }

    /// Records an actuation fault: the machine drops to OFF and stays there
    /// until [`clear_fault`](Self::clear_fault). The returned release pulses
    /// carry no confirmation since the sense path is already suspect.
    pub fn actuation_fault(&mut self, now_ms: u64) -> Vec<PinAction> {
        self.faulted = true;
        self.enter_off(now_ms);
        vec![
            PinAction::Pulse(self.pins.heat_off),
            PinAction::Pulse(self.pins.cool_off),
        ]
    }

    pub fn clear_fault(&mut self) {
        self.faulted = false;
    }

    pub fn status(&self, now_ms: u64) -> HvacStatus {
        HvacStatus {
            mode: self.state.mode.as_str(),
            entered_at_ms: self.state.entered_at_ms,
            dwell_remaining_ms: self.dwell_remaining_ms(now_ms),
            faulted: self.faulted,
            heating_runs: self.heating_runs,
            cooling_runs: self.cooling_runs,
        }
    }

    fn dwell_elapsed(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.state.entered_at_ms) >= self.min_dwell_ms
    }

    fn transition(&mut self, mode: HvacMode, now_ms: u64) {
        self.state = HvacState {
            mode,
            entered_at_ms: now_ms,
        };
    }

    fn enter_off(&mut self, now_ms: u64) {
        match self.state.mode {
            HvacMode::Heating => self.heating_runs += 1,
            HvacMode::Cooling => self.cooling_runs += 1,
            HvacMode::Off => return,
        }
        self.transition(HvacMode::Off, now_ms);
    }

    fn start_heating(&mut self, now_ms: u64, actions: &mut Vec<PinAction>) {
        actions.push(PinAction::Pulse(self.pins.heat_on));
        actions.push(PinAction::Confirm {
            commanded: self.pins.heat_on,
            sense: self.pins.heat_sense,
            expected: PinLevel::High,
        });
        self.transition(HvacMode::Heating, now_ms);
    }

    fn stop_heating(&mut self, now_ms: u64, actions: &mut Vec<PinAction>) {
        actions.push(PinAction::Pulse(self.pins.heat_off));
        actions.push(PinAction::Confirm {
            commanded: self.pins.heat_off,
            sense: self.pins.heat_sense,
            expected: PinLevel::Low,
        });
        self.enter_off(now_ms);
    }

    fn start_cooling(&mut self, now_ms: u64, actions: &mut Vec<PinAction>) {
        actions.push(PinAction::Pulse(self.pins.cool_on));
        actions.push(PinAction::Confirm {
            commanded: self.pins.cool_on,
            sense: self.pins.cool_sense,
            expected: PinLevel::High,
        });
        self.transition(HvacMode::Cooling, now_ms);
    }

    fn stop_cooling(&mut self, now_ms: u64, actions: &mut Vec<PinAction>) {
        actions.push(PinAction::Pulse(self.pins.cool_off));
        actions.push(PinAction::Confirm {
            commanded: self.pins.cool_off,
            sense: self.pins.cool_sense,
            expected: PinLevel::Low,
        });
        self.enter_off(now_ms);
    }
}
