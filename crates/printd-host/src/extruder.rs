//! Extruder records used for temperature commands and tool changes.

use std::sync::Arc;

use thermal::Heater;

/// One extruder: a nozzle heater plus the offsets and settle delays used
/// during tool changes. The filament drive itself is timed by the
/// device; the host only needs the heater and geometry.
pub struct Extruder {
    pub name: String,
    pub index: usize,
    /// XYZ offset of this nozzle from the carriage reference point.
    pub nozzle_offset: [f64; 3],
    pub heater: Arc<Heater>,
    activate_delay: f64,
    deactivate_delay: f64,
}

impl Extruder {
    pub fn new(
        name: String,
        index: usize,
        nozzle_offset: [f64; 3],
        heater: Arc<Heater>,
        activate_delay: f64,
        deactivate_delay: f64,
    ) -> Extruder {
        Extruder {
            name,
            index,
            nozzle_offset,
            heater,
            activate_delay,
            deactivate_delay,
        }
    }

    /// Make this the live extruder; returns the dwell in seconds before
    /// it can take moves.
    pub fn activate(&self, _print_time: f64) -> f64 {
        self.activate_delay
    }

    /// Park this extruder; returns the dwell in seconds before the
    /// carriage may move away.
    pub fn deactivate(&self, _print_time: f64) -> f64 {
        self.deactivate_delay
    }
}
