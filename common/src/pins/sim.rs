//! In-memory latching relay board with fault injection.
//!
//! A rising edge on `heatOn`/`coolOn` latches the matching relay closed and a
//! rising edge on `heatOff`/`coolOff` releases it; the sense pins report the
//! latch state. Faults can be injected per pin to exercise the actuation-fault
//! path without hardware.

use std::collections::{HashMap, HashSet};

use super::{HvacPinSet, HvacPins};
use crate::{
    error::PinError,
    types::{PinId, PinLevel},
};

#[derive(Debug, Clone)]
pub struct RelayBoard {
    pin_set: HvacPinSet,
    outputs: HashMap<PinId, PinLevel>,
    heat_latched: bool,
    cool_latched: bool,
    stuck: HashMap<PinId, PinLevel>,
    read_timeouts: HashSet<PinId>,
    write_failures: HashSet<PinId>,
    writes: Vec<(PinId, PinLevel)>,
}

impl RelayBoard {
    pub fn new(pin_set: HvacPinSet) -> Self {
        Self {
            pin_set,
            outputs: HashMap::new(),
            heat_latched: false,
            cool_latched: false,
            stuck: HashMap::new(),
            read_timeouts: HashSet::new(),
            write_failures: HashSet::new(),
            writes: Vec::new(),
        }
    }

    /// Forces `pin` to read `level` no matter what the relays do.
    pub fn stick(&mut self, pin: PinId, level: PinLevel) {
        self.stuck.insert(pin, level);
    }

    pub fn fail_reads(&mut self, pin: PinId) {
        self.read_timeouts.insert(pin);
    }

    pub fn fail_writes(&mut self, pin: PinId) {
        self.write_failures.insert(pin);
    }

    /// Clears every injected fault; relay latch state is kept.
    pub fn heal(&mut self) {
        self.stuck.clear();
        self.read_timeouts.clear();
        self.write_failures.clear();
    }

    pub fn heat_engaged(&self) -> bool {
        self.heat_latched
    }

    pub fn cool_engaged(&self) -> bool {
        self.cool_latched
    }

    pub fn writes(&self) -> &[(PinId, PinLevel)] {
        &self.writes
    }

    pub fn pulses(&self, pin: PinId) -> usize {
        self.writes
            .iter()
            .filter(|(written, level)| *written == pin && level.is_high())
            .count()
    }

    pub fn clear_history(&mut self) {
        self.writes.clear();
    }

    fn on_rising_edge(&mut self, pin: PinId) {
        let pins = self.pin_set;
        if pin == pins.heat_on {
            self.heat_latched = true;
        } else if pin == pins.heat_off {
            self.heat_latched = false;
        } else if pin == pins.cool_on {
            self.cool_latched = true;
        } else if pin == pins.cool_off {
            self.cool_latched = false;
        }
    }
}

impl HvacPins for RelayBoard {
    fn write(&mut self, pin: PinId, level: PinLevel) -> Result<(), PinError> {
        if self.write_failures.contains(&pin) {
            return Err(PinError::Io {
                pin,
                reason: "injected write failure".to_string(),
            });
        }

        self.writes.push((pin, level));
        let previous = self.outputs.insert(pin, level).unwrap_or(PinLevel::Low);
        if previous == PinLevel::Low && level == PinLevel::High {
            self.on_rising_edge(pin);
        }
        Ok(())
    }

    fn read(&mut self, pin: PinId) -> Result<PinLevel, PinError> {
        if self.read_timeouts.contains(&pin) {
            return Err(PinError::Timeout(pin));
        }
        if let Some(level) = self.stuck.get(&pin) {
            return Ok(*level);
        }

        let level = if pin == self.pin_set.heat_sense {
            PinLevel::from_bool(self.heat_latched)
        } else if pin == self.pin_set.cool_sense {
            PinLevel::from_bool(self.cool_latched)
        } else {
            self.outputs.get(&pin).copied().unwrap_or(PinLevel::Low)
        };
        Ok(level)
    }
}
