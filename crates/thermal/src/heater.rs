//! The heater object: sampled state, controller dispatch, and PWM rate
//! limiting.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use mcu_io::{Mcu, McuPwm};

use crate::control::{Control, ControlAutoTune, ControlBangBang, ControlBumpTest, ControlPid};
use crate::sensor::Sensor;
use crate::{MAX_HEAT_TIME, PWM_CYCLE_TIME, REPORT_TIME, SAMPLE_COUNT, SAMPLE_TIME};

#[derive(Debug, Error)]
pub enum HeaterError {
    #[error("Requested temperature ({0:.1}) out of range ({1:.1}:{2:.1})")]
    TempOutOfRange(f64, f64, f64),
}

/// Control algorithm selection from config.
#[derive(Debug, Clone)]
pub enum ControlConfig {
    Watermark {
        max_delta: f64,
    },
    Pid {
        kp: f64,
        ki: f64,
        kd: f64,
        deriv_time: f64,
        /// Bound on the integral term's output contribution; defaults to
        /// the heater's `max_power`.
        integral_max: Option<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct HeaterConfig {
    pub name: String,
    pub heater_pin: String,
    pub sensor_pin: String,
    pub sensor: Sensor,
    pub control: ControlConfig,
    pub min_temp: f64,
    pub max_temp: f64,
    pub min_extrude_temp: f64,
    /// Output ceiling, in (0, 1].
    pub max_power: f64,
}

/// The group of fields shared with the ADC delivery thread; guarded by
/// the heater mutex as one unit.
pub(crate) struct HeaterState {
    pub last_temp: f64,
    pub last_temp_time: f64,
    pub target_temp: f64,
    pub can_extrude: bool,
    /// Always `Some` between calls; moved out while a controller runs so
    /// it can reach back into the rest of the state.
    pub control: Option<Control>,
    pub next_pwm_time: f64,
    pub last_pwm_value: f64,
}

/// One closed-loop heater.
///
/// Everything outside `state` is immutable after construction, so the
/// reactor thread and the ADC thread only contend on the one mutex.
pub struct Heater {
    pub name: String,
    pub(crate) sensor: Sensor,
    pub min_temp: f64,
    pub max_temp: f64,
    pub min_extrude_temp: f64,
    pub max_power: f64,
    force_extrude: bool,
    mcu_pwm: Arc<dyn McuPwm>,
    state: Mutex<HeaterState>,
}

impl Heater {
    pub fn new(mcu: &dyn Mcu, config: HeaterConfig) -> Arc<Heater> {
        let HeaterConfig {
            name,
            heater_pin,
            sensor_pin,
            sensor,
            control,
            min_temp,
            max_temp,
            min_extrude_temp,
            max_power,
        } = config;
        // Full-power bang-bang can drive a plain digital output; anything
        // else needs real PWM.
        let use_digital = matches!(control, ControlConfig::Watermark { .. }) && max_power == 1.;
        let mcu_pwm = if use_digital {
            mcu.create_digital_out(&heater_pin, MAX_HEAT_TIME)
        } else {
            mcu.create_pwm(&heater_pin, PWM_CYCLE_TIME, 0., MAX_HEAT_TIME)
        };
        let control = match control {
            ControlConfig::Watermark { max_delta } => {
                Control::BangBang(ControlBangBang::new(max_delta))
            }
            ControlConfig::Pid {
                kp,
                ki,
                kd,
                deriv_time,
                integral_max,
            } => Control::Pid(ControlPid::new(
                kp,
                ki,
                kd,
                deriv_time,
                integral_max.unwrap_or(max_power),
            )),
        };
        let mcu_adc = mcu.create_adc(&sensor_pin);
        let adc_min = sensor.calc_adc(min_temp);
        let adc_max = sensor.calc_adc(max_temp);
        mcu_adc.set_minmax(
            SAMPLE_TIME,
            SAMPLE_COUNT,
            adc_min.min(adc_max),
            adc_min.max(adc_max),
        );
        let force_extrude = min_extrude_temp <= 0. || mcu.is_fileoutput();
        let heater = Arc::new(Heater {
            name,
            sensor,
            min_temp,
            max_temp,
            min_extrude_temp,
            max_power,
            force_extrude,
            mcu_pwm,
            state: Mutex::new(HeaterState {
                last_temp: 0.,
                last_temp_time: 0.,
                target_temp: 0.,
                can_extrude: force_extrude,
                control: Some(control),
                next_pwm_time: 0.,
                last_pwm_value: 0.,
            }),
        });
        let cb_heater = heater.clone();
        mcu_adc.set_adc_callback(
            REPORT_TIME,
            Arc::new(move |read_time, value| cb_heater.adc_callback(read_time, value)),
        );
        heater
    }

    /// Emit a PWM update unless suppression applies. Called with the
    /// state lock held.
    ///
    /// The device watchdog cuts outputs not refreshed within
    /// [`MAX_HEAT_TIME`], so a nonzero value is re-sent once 75% of that
    /// window has passed even without a significant change.
    pub(crate) fn set_pwm(&self, st: &mut HeaterState, read_time: f64, mut value: f64) {
        if st.target_temp <= 0. {
            value = 0.;
        }
        if (read_time < st.next_pwm_time || st.last_pwm_value == 0.)
            && (value - st.last_pwm_value).abs() < 0.05
        {
            // No significant change in value - can suppress update
            return;
        }
        let pwm_time = read_time + REPORT_TIME + SAMPLE_TIME * SAMPLE_COUNT as f64;
        st.next_pwm_time = pwm_time + 0.75 * MAX_HEAT_TIME;
        st.last_pwm_value = value;
        debug!(
            heater = %self.name,
            value,
            pwm_time,
            last_temp = st.last_temp,
            target = st.target_temp,
            "pwm update"
        );
        self.mcu_pwm.set_pwm(pwm_time, value);
    }

    /// Entry point for ADC reports; invoked from the transport's I/O
    /// thread.
    pub fn adc_callback(&self, read_time: f64, read_value: f64) {
        let temp = self.sensor.calc_temp(read_value);
        let mut st = self.state.lock();
        st.last_temp = temp;
        st.last_temp_time = read_time;
        st.can_extrude = self.force_extrude || temp >= self.min_extrude_temp;
        if let Some(mut control) = st.control.take() {
            control.adc_callback(self, &mut st, read_time, temp);
            st.control = Some(control);
        }
    }

    /// Set the target temperature. Zero is always allowed and disables
    /// the output.
    pub fn set_temp(&self, _print_time: f64, degrees: f64) -> Result<(), HeaterError> {
        self.check_range(degrees)?;
        self.state.lock().target_temp = degrees;
        Ok(())
    }

    /// `(current, target)` in Celsius.
    pub fn get_temp(&self) -> (f64, f64) {
        let st = self.state.lock();
        (st.last_temp, st.target_temp)
    }

    pub fn can_extrude(&self) -> bool {
        self.state.lock().can_extrude
    }

    /// True while the controller has not settled. When a finished tuning
    /// controller reports idle, the controller it replaced is restored.
    pub fn check_busy(&self) -> bool {
        let mut st = self.state.lock();
        let Some(mut control) = st.control.take() else {
            return false;
        };
        let busy = control.check_busy(self, &st);
        if !busy {
            if let Some(previous) = control.take_finished() {
                control = *previous;
            }
        }
        st.control = Some(control);
        busy
    }

    /// Replace the controller with a relay autotune run at `degrees`.
    /// The target is set as well: a zero target would force the output
    /// low and the relay could never oscillate.
    pub fn start_auto_tune(&self, degrees: f64) -> Result<(), HeaterError> {
        self.check_range(degrees)?;
        let mut st = self.state.lock();
        st.target_temp = degrees;
        if let Some(old) = st.control.take() {
            st.control = Some(Control::AutoTune(ControlAutoTune::new(old, degrees)));
        }
        Ok(())
    }

    /// Replace the controller with an open-loop bump test at `degrees`.
    pub fn start_bump_test(&self, degrees: f64) -> Result<(), HeaterError> {
        self.check_range(degrees)?;
        let mut st = self.state.lock();
        st.target_temp = degrees;
        if let Some(old) = st.control.take() {
            st.control = Some(Control::BumpTest(ControlBumpTest::new(old, degrees)));
        }
        Ok(())
    }

    /// Name of the active control algorithm; used for status reporting.
    pub fn control_kind(&self) -> &'static str {
        match self.state.lock().control {
            Some(Control::BangBang(_)) => "watermark",
            Some(Control::Pid(_)) => "pid",
            Some(Control::AutoTune(_)) => "autotune",
            Some(Control::BumpTest(_)) => "bumptest",
            None => "none",
        }
    }

    fn check_range(&self, degrees: f64) -> Result<(), HeaterError> {
        if degrees != 0. && (degrees < self.min_temp || degrees > self.max_temp) {
            return Err(HeaterError::TempOutOfRange(
                degrees,
                self.min_temp,
                self.max_temp,
            ));
        }
        Ok(())
    }
}
