//! Part-cooling fan output.

use std::cell::Cell;
use std::sync::Arc;

use mcu_io::{Mcu, McuPwm};

const FAN_CYCLE_TIME: f64 = 0.010;

#[derive(Debug, Clone)]
pub struct FanConfig {
    pub pin: String,
    pub max_power: f64,
}

pub struct PrinterFan {
    mcu_fan: Arc<dyn McuPwm>,
    max_power: f64,
    last_fan_value: Cell<f64>,
}

impl PrinterFan {
    pub fn new(mcu: &dyn Mcu, config: &FanConfig) -> PrinterFan {
        PrinterFan {
            mcu_fan: mcu.create_pwm(&config.pin, FAN_CYCLE_TIME, 0., 0.),
            max_power: config.max_power,
            last_fan_value: Cell::new(0.),
        }
    }

    pub fn set_speed(&self, print_time: f64, value: f64) {
        let value = value.clamp(0., self.max_power);
        if value == self.last_fan_value.get() {
            return;
        }
        let mcu_time = self.mcu_fan.print_to_mcu_time(print_time);
        self.mcu_fan.set_pwm(mcu_time, value);
        self.last_fan_value.set(value);
    }
}
