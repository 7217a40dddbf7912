//! RC servo output: angle or pulse width in, PWM duty cycle out.
//!
//! All time units are in seconds.

use std::cell::Cell;
use std::sync::Arc;

use mcu_io::{Mcu, McuPwm};

/// Standard RC servo frame period.
const SERVO_SIGNAL_PERIOD: f64 = 0.020;

/// A `[servo]` / `[servoN]` config section. Pulse widths are given in
/// microseconds in the file and converted at load.
#[derive(Debug, Clone)]
pub struct ServoConfig {
    pub name: String,
    pub servo_pin: String,
    pub minimum_pulse_width: f64,
    pub maximum_pulse_width: f64,
    pub maximum_servo_angle: f64,
}

pub struct Servo {
    name: String,
    mcu_servo: Arc<dyn McuPwm>,
    min_pulse_width: f64,
    max_pulse_width: f64,
    max_angle: f64,
    width_per_degree: f64,
    last_pulsewidth: Cell<f64>,
}

impl Servo {
    pub fn new(mcu: &dyn Mcu, config: &ServoConfig) -> Servo {
        let mcu_servo = mcu.create_pwm(&config.servo_pin, SERVO_SIGNAL_PERIOD, 0., 0.);
        Servo {
            name: config.name.clone(),
            mcu_servo,
            min_pulse_width: config.minimum_pulse_width,
            max_pulse_width: config.maximum_pulse_width,
            max_angle: config.maximum_servo_angle,
            width_per_degree: (config.maximum_pulse_width - config.minimum_pulse_width)
                / config.maximum_servo_angle,
            last_pulsewidth: Cell::new(-1.),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_pulsewidth(&self, print_time: f64, pulsewidth: f64) {
        let pulsewidth = pulsewidth.clamp(self.min_pulse_width, self.max_pulse_width);
        if pulsewidth == self.last_pulsewidth.get() {
            return;
        }
        let dutycycle = pulsewidth / SERVO_SIGNAL_PERIOD;
        let mcu_time = self.mcu_servo.print_to_mcu_time(print_time);
        self.mcu_servo.set_pwm(mcu_time, dutycycle);
        self.last_pulsewidth.set(pulsewidth);
    }

    pub fn set_angle(&self, print_time: f64, angle: f64) {
        let angle = angle.clamp(0., self.max_angle);
        let pulsewidth = self.min_pulse_width + angle * self.width_per_degree;
        self.set_pulsewidth(print_time, pulsewidth);
    }
}
