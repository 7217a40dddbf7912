//! Heater control algorithms.
//!
//! The active algorithm is a sum type swapped under the heater lock; the
//! tuning controllers (autotune, bump test) remember the controller they
//! replaced and hand it back when they finish.

use std::f64::consts::PI;

use tracing::{debug, info, warn};

use crate::heater::{Heater, HeaterState};
use crate::{AMBIENT_TEMP, PID_PARAM_BASE, REPORT_TIME};

/// Relay hysteresis used by the autotuner: full heat below
/// `target - TUNE_PID_DELTA`, no heat above `target`.
pub const TUNE_PID_DELTA: f64 = 5.0;

/// Active control algorithm for a heater.
pub enum Control {
    BangBang(ControlBangBang),
    Pid(ControlPid),
    AutoTune(ControlAutoTune),
    BumpTest(ControlBumpTest),
}

impl Control {
    /// Run one control step for an ADC report. Called with the heater
    /// lock held (the controller is temporarily moved out of the state).
    pub(crate) fn adc_callback(
        &mut self,
        heater: &Heater,
        st: &mut HeaterState,
        read_time: f64,
        temp: f64,
    ) {
        let value = match self {
            Control::BangBang(c) => Some(c.update(st.target_temp, heater.max_power, temp)),
            Control::Pid(c) => Some(c.update(st.target_temp, heater.max_power, read_time, temp)),
            Control::AutoTune(c) => Some(c.update(heater, read_time, temp)),
            Control::BumpTest(c) => c.update(heater, read_time, temp),
        };
        if let Some(value) = value {
            heater.set_pwm(st, read_time, value);
        }
    }

    /// True while the controller has not settled (or, for the tuning
    /// controllers, has not finished).
    pub(crate) fn check_busy(&mut self, heater: &Heater, st: &HeaterState) -> bool {
        match self {
            Control::BangBang(c) => st.last_temp < st.target_temp - c.max_delta,
            Control::Pid(c) => {
                let temp_diff = st.target_temp - st.last_temp;
                temp_diff.abs() > 1. || c.prev_temp_deriv.abs() > 0.1
            }
            Control::AutoTune(c) => c.check_busy(heater),
            Control::BumpTest(c) => c.state < 3,
        }
    }

    /// For tuning controllers that finished, hand back the controller
    /// they replaced.
    pub(crate) fn take_finished(&mut self) -> Option<Box<Control>> {
        match self {
            Control::AutoTune(c) => c.old_control.take(),
            Control::BumpTest(c) => c.old_control.take(),
            _ => None,
        }
    }
}

/// Bang-bang ("watermark") control with a hysteresis band around the
/// target.
pub struct ControlBangBang {
    max_delta: f64,
    heating: bool,
}

impl ControlBangBang {
    pub fn new(max_delta: f64) -> ControlBangBang {
        ControlBangBang {
            max_delta,
            heating: false,
        }
    }

    fn update(&mut self, target_temp: f64, max_power: f64, temp: f64) -> f64 {
        if self.heating && temp >= target_temp + self.max_delta {
            self.heating = false;
        } else if !self.heating && temp <= target_temp - self.max_delta {
            self.heating = true;
        }
        if self.heating {
            max_power
        } else {
            0.
        }
    }
}

/// Proportional-integral-derivative control.
///
/// The derivative acts on the measurement (not the error), low-pass
/// blended when samples arrive faster than `min_deriv_time`; the integral
/// is clamped and only committed while the output is unsaturated.
pub struct ControlPid {
    kp: f64,
    ki: f64,
    kd: f64,
    min_deriv_time: f64,
    temp_integ_max: f64,
    prev_temp: f64,
    prev_temp_time: f64,
    prev_temp_deriv: f64,
    prev_temp_integ: f64,
}

impl ControlPid {
    /// Gains are given in config units and divided down by
    /// [`PID_PARAM_BASE`] here. `integral_max` bounds the integral term's
    /// contribution to the output.
    pub fn new(kp: f64, ki: f64, kd: f64, min_deriv_time: f64, integral_max: f64) -> ControlPid {
        let ki = ki / PID_PARAM_BASE;
        ControlPid {
            kp: kp / PID_PARAM_BASE,
            ki,
            kd: kd / PID_PARAM_BASE,
            min_deriv_time,
            temp_integ_max: integral_max / ki,
            prev_temp: AMBIENT_TEMP,
            prev_temp_time: 0.,
            prev_temp_deriv: 0.,
            prev_temp_integ: 0.,
        }
    }

    fn update(&mut self, target_temp: f64, max_power: f64, read_time: f64, temp: f64) -> f64 {
        let time_diff = read_time - self.prev_temp_time;
        // Change of temperature
        let temp_diff = temp - self.prev_temp;
        let temp_deriv = if time_diff >= self.min_deriv_time {
            temp_diff / time_diff
        } else {
            (self.prev_temp_deriv * (self.min_deriv_time - time_diff) + temp_diff)
                / self.min_deriv_time
        };
        // Accumulated temperature "error"
        let temp_err = target_temp - temp;
        let temp_integ = (self.prev_temp_integ + temp_err * time_diff).clamp(0., self.temp_integ_max);
        let co = self.kp * temp_err + self.ki * temp_integ - self.kd * temp_deriv;
        debug!(temp, read_time, temp_deriv, temp_err, temp_integ, co, "pid");
        let bounded_co = co.clamp(0., max_power);
        // Store state for next measurement
        self.prev_temp = temp;
        self.prev_temp_time = read_time;
        self.prev_temp_deriv = temp_deriv;
        if co == bounded_co {
            self.prev_temp_integ = temp_integ;
        }
        bounded_co
    }
}

/// Ziegler-Nichols relay autotuning: oscillate around the target at full
/// power and derive PID gains from the oscillation's period and
/// amplitude.
pub struct ControlAutoTune {
    target_temp: f64,
    heating: bool,
    /// `(temp, time)` of each recorded oscillation extreme.
    peaks: Vec<(f64, f64)>,
    peak: f64,
    peak_time: f64,
    tuned: Option<(f64, f64, f64)>,
    old_control: Option<Box<Control>>,
}

impl ControlAutoTune {
    pub(crate) fn new(old_control: Control, target_temp: f64) -> ControlAutoTune {
        ControlAutoTune {
            target_temp,
            heating: false,
            peaks: Vec::new(),
            peak: 0.,
            peak_time: 0.,
            tuned: None,
            old_control: Some(Box::new(old_control)),
        }
    }

    /// Final `(Kp, Ki, Kd)` estimate, unscaled.
    pub fn tuned_gains(&self) -> Option<(f64, f64, f64)> {
        self.tuned
    }

    fn update(&mut self, heater: &Heater, read_time: f64, temp: f64) -> f64 {
        if self.heating && temp >= self.target_temp {
            self.heating = false;
            self.check_peaks(heater);
        } else if !self.heating && temp <= self.target_temp - TUNE_PID_DELTA {
            self.heating = true;
            self.check_peaks(heater);
        }
        if self.heating {
            if temp < self.peak {
                self.peak = temp;
                self.peak_time = read_time;
            }
            heater.max_power
        } else {
            if temp > self.peak {
                self.peak = temp;
                self.peak_time = read_time;
            }
            0.
        }
    }

    fn check_peaks(&mut self, heater: &Heater) {
        self.peaks.push((self.peak, self.peak_time));
        self.peak = if self.heating { 9999999. } else { -9999999. };
        if self.peaks.len() < 4 {
            return;
        }
        let n = self.peaks.len();
        let temp_diff = self.peaks[n - 1].0 - self.peaks[n - 2].0;
        let time_diff = self.peaks[n - 1].1 - self.peaks[n - 3].1;
        // Relay-method ultimate gain and period
        let ku = 4. * (2. * heater.max_power) / (temp_diff.abs() * PI);
        let tu = time_diff;
        let kp = 0.6 * ku;
        let ti = 0.5 * tu;
        let td = 0.125 * tu;
        let ki = kp / ti;
        let kd = kp * td;
        debug!(
            heater = %heater.name,
            raw_temp_diff = temp_diff,
            ku,
            tu,
            "autotune oscillation sample"
        );
        self.tuned = Some((kp, ki, kd));
    }

    fn check_busy(&mut self, heater: &Heater) -> bool {
        if self.heating || self.peaks.len() < 12 {
            return true;
        }
        if let Some((kp, ki, kd)) = self.tuned {
            info!(
                heater = %heater.name,
                kp = kp * PID_PARAM_BASE,
                ki = ki * PID_PARAM_BASE,
                kd = kd * PID_PARAM_BASE,
                "autotune complete"
            );
        }
        false
    }
}

/// Open-loop bump test: record ambient, drive full power to the target,
/// then record the decay; the samples are dumped for offline analysis.
pub struct ControlBumpTest {
    target_temp: f64,
    state: u8,
    temp_samples: Vec<(f64, f64)>,
    pwm_samples: Vec<(f64, f64)>,
    old_control: Option<Box<Control>>,
}

impl ControlBumpTest {
    pub(crate) fn new(old_control: Control, target_temp: f64) -> ControlBumpTest {
        ControlBumpTest {
            target_temp,
            state: 0,
            temp_samples: Vec::new(),
            pwm_samples: Vec::new(),
            old_control: Some(Box::new(old_control)),
        }
    }

    fn record_pwm(&mut self, read_time: f64, value: f64) -> f64 {
        // The output takes effect roughly two report cycles after the
        // sample that caused it.
        self.pwm_samples.push((read_time + 2. * REPORT_TIME, value));
        value
    }

    fn update(&mut self, heater: &Heater, read_time: f64, temp: f64) -> Option<f64> {
        self.temp_samples.push((read_time, temp));
        match self.state {
            0 => {
                let value = self.record_pwm(read_time, 0.);
                if self.temp_samples.len() >= 20 {
                    self.state += 1;
                }
                Some(value)
            }
            1 => {
                if temp < self.target_temp {
                    return Some(self.record_pwm(read_time, heater.max_power));
                }
                let value = self.record_pwm(read_time, 0.);
                self.state += 1;
                Some(value)
            }
            2 => {
                let value = self.record_pwm(read_time, 0.);
                if temp <= (self.target_temp + AMBIENT_TEMP) / 2. {
                    self.dump_stats(heater);
                    self.state += 1;
                }
                Some(value)
            }
            _ => None,
        }
    }

    fn dump_stats(&self, heater: &Heater) {
        let mut samples = self.temp_samples.clone();
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        let out: Vec<String> = samples
            .iter()
            .map(|&(time, temp)| {
                let pwm = self
                    .pwm_samples
                    .iter()
                    .find(|(t, _)| (t - time).abs() < 1e-9)
                    .map(|(_, v)| *v)
                    .unwrap_or(-1.);
                format!("{:.3} {:.1} {}", time, temp, pwm as i64)
            })
            .collect();
        let path = std::env::temp_dir().join("heattest.txt");
        if let Err(e) = std::fs::write(&path, out.join("\n")) {
            warn!(heater = %heater.name, error = %e, "failed to write bump test dump");
        } else {
            info!(heater = %heater.name, path = %path.display(), "bump test samples written");
        }
    }
}
