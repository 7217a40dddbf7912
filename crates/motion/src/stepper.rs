//! Per-axis stepper configuration and motor enable tracking.

use std::sync::Arc;

use mcu_io::{Mcu, McuEndstop, McuPwm, McuStepper};

/// Configuration for one axis stepper, as read from a `[stepper_*]`
/// config section. Positions and distances are in user units.
#[derive(Debug, Clone)]
pub struct StepperConfig {
    pub name: String,
    pub step_pin: String,
    pub dir_pin: String,
    pub enable_pin: Option<String>,
    pub endstop_pin: String,
    /// Travel per step; `inv_step_dist` is derived from this.
    pub step_dist: f64,
    pub position_min: f64,
    pub position_max: f64,
    pub position_endstop: f64,
    pub homing_speed: f64,
    pub homing_retract_dist: f64,
    pub homing_positive_dir: bool,
}

/// One axis stepper: immutable configuration plus the device handles that
/// carry out step generation and endstop sampling. Created at config load
/// and alive for the process.
pub struct Stepper {
    pub name: String,
    pub step_dist: f64,
    pub inv_step_dist: f64,
    pub position_min: f64,
    pub position_max: f64,
    pub position_endstop: f64,
    pub homing_speed: f64,
    pub homing_retract_dist: f64,
    pub homing_positive_dir: bool,
    /// True until the motor driver has been enabled for this stepper.
    pub need_motor_enable: bool,
    pub mcu_stepper: Arc<dyn McuStepper>,
    pub mcu_endstop: Arc<dyn McuEndstop>,
    mcu_enable: Option<Arc<dyn McuPwm>>,
    enabled: bool,
}

impl Stepper {
    pub fn new(mcu: &dyn Mcu, config: &StepperConfig) -> Stepper {
        let mcu_stepper = mcu.create_stepper(&config.step_pin, &config.dir_pin);
        let mcu_endstop = mcu.create_endstop(&config.endstop_pin);
        mcu_endstop.add_stepper(mcu_stepper.clone());
        let mcu_enable = config
            .enable_pin
            .as_deref()
            .map(|pin| mcu.create_digital_out(pin, 0.));
        Stepper {
            name: config.name.clone(),
            step_dist: config.step_dist,
            inv_step_dist: 1. / config.step_dist,
            position_min: config.position_min,
            position_max: config.position_max,
            position_endstop: config.position_endstop,
            homing_speed: config.homing_speed,
            homing_retract_dist: config.homing_retract_dist,
            homing_positive_dir: config.homing_positive_dir,
            need_motor_enable: true,
            mcu_stepper,
            mcu_endstop,
            mcu_enable,
            enabled: false,
        }
    }

    /// Drive the enable pin (when present) on state changes and track
    /// whether the motor still needs enabling before it can step.
    pub fn motor_enable(&mut self, print_time: f64, enable: bool) {
        if self.enabled != enable {
            if let Some(out) = &self.mcu_enable {
                let mcu_time = out.print_to_mcu_time(print_time);
                out.set_pwm(mcu_time, if enable { 1. } else { 0. });
            }
            self.enabled = enable;
        }
        self.need_motor_enable = !enable;
    }
}
