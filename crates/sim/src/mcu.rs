//! Simulated MCU transport.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use mcu_io::{AdcCallback, Mcu, McuAdc, McuEndstop, McuError, McuPwm, McuStepper};

/// Which timing curve a step segment was scheduled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Constant-acceleration segment (`step_sqrt`).
    Sqrt,
    /// Constant-velocity segment (`step_factor`).
    Factor,
}

/// One scheduled step segment as recorded by a simulated stepper.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub stepper: String,
    pub kind: StepKind,
    pub mcu_time: f64,
    /// Requested (fractional, signed) step count.
    pub steps: f64,
    pub step_offset: f64,
    pub factor: f64,
    /// Integer count the device reported back.
    pub count: f64,
}

/// One PWM or digital write as recorded by a simulated output pin.
#[derive(Debug, Clone, PartialEq)]
pub struct PwmRecord {
    pub pin: String,
    pub mcu_time: f64,
    pub value: f64,
}

#[derive(Default)]
struct SimState {
    steps: Vec<StepRecord>,
    pwm: Vec<PwmRecord>,
    shutdown: Option<String>,
}

/// Stepper channel fake. The device model queues exactly the integer
/// count that moves the commanded position onto the continuous motion's
/// endpoint, which is what keeps the host's `step_offset` re-anchoring
/// honest.
pub struct SimStepper {
    name: String,
    pos: Mutex<i64>,
    /// Extra steps reported on the next scheduling call only; lets tests
    /// exercise the host's count re-anchoring.
    skew: Mutex<i64>,
    state: Arc<Mutex<SimState>>,
}

impl SimStepper {
    pub fn set_count_skew(&self, steps: i64) {
        *self.skew.lock() = steps;
    }

    fn schedule(
        &self,
        kind: StepKind,
        mcu_time: f64,
        steps: f64,
        step_offset: f64,
        factor: f64,
    ) -> f64 {
        let skew = std::mem::take(&mut *self.skew.lock());
        let mut pos = self.pos.lock();
        let continuous_end = *pos as f64 - step_offset + steps;
        let count = (continuous_end.round() as i64 - *pos) + skew;
        *pos += count;
        let count = count as f64;
        debug!(stepper = %self.name, ?kind, mcu_time, steps, count, "schedule steps");
        self.state.lock().steps.push(StepRecord {
            stepper: self.name.clone(),
            kind,
            mcu_time,
            steps,
            step_offset,
            factor,
            count,
        });
        count
    }
}

impl McuStepper for SimStepper {
    fn set_position(&self, steps: i64) {
        *self.pos.lock() = steps;
    }

    fn commanded_position(&self) -> i64 {
        *self.pos.lock()
    }

    fn print_to_mcu_time(&self, print_time: f64) -> f64 {
        print_time
    }

    fn step_sqrt(
        &self,
        mcu_time: f64,
        steps: f64,
        step_offset: f64,
        sqrt_offset: f64,
        factor: f64,
    ) -> Result<f64, McuError> {
        let _ = sqrt_offset;
        Ok(self.schedule(StepKind::Sqrt, mcu_time, steps, step_offset, factor))
    }

    fn step_factor(
        &self,
        mcu_time: f64,
        steps: f64,
        step_offset: f64,
        factor: f64,
    ) -> Result<f64, McuError> {
        Ok(self.schedule(StepKind::Factor, mcu_time, steps, step_offset, factor))
    }
}

/// Endstop fake with scripted trigger state.
pub struct SimEndstop {
    pin: String,
    steppers: Mutex<Vec<Arc<dyn McuStepper>>>,
    triggered: Mutex<bool>,
    home_failure: Mutex<bool>,
    homing: Mutex<Option<(f64, f64)>>,
}

impl SimEndstop {
    /// Script the state reported by `query_endstop_wait`.
    pub fn set_triggered(&self, triggered: bool) {
        *self.triggered.lock() = triggered;
    }

    /// When set, `home_wait` reports that the endstop never triggered.
    pub fn set_home_failure(&self, fail: bool) {
        *self.home_failure.lock() = fail;
    }

    /// Steppers this endstop halts when it triggers during homing.
    pub fn watched_steppers(&self) -> usize {
        self.steppers.lock().len()
    }
}

impl McuEndstop for SimEndstop {
    fn add_stepper(&self, stepper: Arc<dyn McuStepper>) {
        self.steppers.lock().push(stepper);
    }

    fn home_start(&self, mcu_time: f64, rest_time: f64) {
        *self.homing.lock() = Some((mcu_time, rest_time));
    }

    fn home_finalize(&self, _mcu_time: f64) -> Result<(), McuError> {
        *self.homing.lock() = None;
        Ok(())
    }

    fn home_wait(&self) -> Result<(), McuError> {
        if *self.home_failure.lock() {
            return Err(McuError::EndstopNotTriggered {
                name: self.pin.clone(),
            });
        }
        Ok(())
    }

    fn query_endstop(&self, _mcu_time: f64) {}

    fn query_endstop_wait(&self) -> bool {
        *self.triggered.lock()
    }
}

/// PWM/digital output fake; every accepted write is logged.
pub struct SimPwm {
    pin: String,
    state: Arc<Mutex<SimState>>,
}

impl McuPwm for SimPwm {
    fn set_pwm(&self, mcu_time: f64, value: f64) {
        debug!(pin = %self.pin, mcu_time, value, "pwm write");
        self.state.lock().pwm.push(PwmRecord {
            pin: self.pin.clone(),
            mcu_time,
            value,
        });
    }

    fn print_to_mcu_time(&self, print_time: f64) -> f64 {
        print_time
    }
}

/// ADC fake. Samples are pushed by the test, either directly or from a
/// spawned feeder thread to mimic the transport's I/O thread.
pub struct SimAdc {
    pin: String,
    minmax: Mutex<Option<(f64, u32, f64, f64)>>,
    callback: Mutex<Option<(f64, AdcCallback)>>,
}

impl SimAdc {
    /// Deliver one `(read_time, value)` report as the transport would.
    pub fn deliver(&self, read_time: f64, value: f64) {
        let callback = self.callback.lock().as_ref().map(|(_, cb)| cb.clone());
        if let Some(cb) = callback {
            cb(read_time, value);
        }
    }

    /// Spawn a feeder thread delivering reports pushed into the returned
    /// channel; exercises the cross-thread path into the heater lock.
    pub fn spawn_feed(self: &Arc<Self>) -> crossbeam_channel::Sender<(f64, f64)> {
        let (tx, rx) = crossbeam_channel::unbounded::<(f64, f64)>();
        let adc = self.clone();
        std::thread::spawn(move || {
            for (read_time, value) in rx {
                adc.deliver(read_time, value);
            }
        });
        tx
    }

    pub fn minmax(&self) -> Option<(f64, u32, f64, f64)> {
        *self.minmax.lock()
    }

    pub fn report_time(&self) -> Option<f64> {
        self.callback.lock().as_ref().map(|(t, _)| *t)
    }
}

impl McuAdc for SimAdc {
    fn set_minmax(&self, sample_time: f64, sample_count: u32, minval: f64, maxval: f64) {
        *self.minmax.lock() = Some((sample_time, sample_count, minval, maxval));
    }

    fn set_adc_callback(&self, report_time: f64, callback: AdcCallback) {
        *self.callback.lock() = Some((report_time, callback));
    }
}

/// The simulated device. Handles are registered by pin name so tests can
/// reach back into them.
pub struct SimMcu {
    fileoutput: bool,
    state: Arc<Mutex<SimState>>,
    steppers: Mutex<HashMap<String, Arc<SimStepper>>>,
    endstops: Mutex<HashMap<String, Arc<SimEndstop>>>,
    adcs: Mutex<HashMap<String, Arc<SimAdc>>>,
}

impl SimMcu {
    pub fn new(fileoutput: bool) -> SimMcu {
        SimMcu {
            fileoutput,
            state: Arc::new(Mutex::new(SimState::default())),
            steppers: Mutex::new(HashMap::new()),
            endstops: Mutex::new(HashMap::new()),
            adcs: Mutex::new(HashMap::new()),
        }
    }

    pub fn step_log(&self) -> Vec<StepRecord> {
        self.state.lock().steps.clone()
    }

    pub fn pwm_log(&self) -> Vec<PwmRecord> {
        self.state.lock().pwm.clone()
    }

    /// PWM writes for a single pin, in order.
    pub fn pwm_log_for(&self, pin: &str) -> Vec<PwmRecord> {
        self.state
            .lock()
            .pwm
            .iter()
            .filter(|r| r.pin == pin)
            .cloned()
            .collect()
    }

    pub fn stepper(&self, step_pin: &str) -> Option<Arc<SimStepper>> {
        self.steppers.lock().get(step_pin).cloned()
    }

    pub fn endstop(&self, pin: &str) -> Option<Arc<SimEndstop>> {
        self.endstops.lock().get(pin).cloned()
    }

    pub fn adc(&self, pin: &str) -> Option<Arc<SimAdc>> {
        self.adcs.lock().get(pin).cloned()
    }
}

impl Mcu for SimMcu {
    fn create_digital_out(&self, pin: &str, _max_duration: f64) -> Arc<dyn McuPwm> {
        Arc::new(SimPwm {
            pin: pin.to_string(),
            state: self.state.clone(),
        })
    }

    fn create_pwm(
        &self,
        pin: &str,
        _cycle_time: f64,
        _initial_value: f64,
        _max_duration: f64,
    ) -> Arc<dyn McuPwm> {
        Arc::new(SimPwm {
            pin: pin.to_string(),
            state: self.state.clone(),
        })
    }

    fn create_adc(&self, pin: &str) -> Arc<dyn McuAdc> {
        let adc = Arc::new(SimAdc {
            pin: pin.to_string(),
            minmax: Mutex::new(None),
            callback: Mutex::new(None),
        });
        self.adcs.lock().insert(adc.pin.clone(), adc.clone());
        adc
    }

    fn create_stepper(&self, step_pin: &str, _dir_pin: &str) -> Arc<dyn McuStepper> {
        let stepper = Arc::new(SimStepper {
            name: step_pin.to_string(),
            pos: Mutex::new(0),
            skew: Mutex::new(0),
            state: self.state.clone(),
        });
        self.steppers
            .lock()
            .insert(stepper.name.clone(), stepper.clone());
        stepper
    }

    fn create_endstop(&self, pin: &str) -> Arc<dyn McuEndstop> {
        let endstop = Arc::new(SimEndstop {
            pin: pin.to_string(),
            steppers: Mutex::new(Vec::new()),
            triggered: Mutex::new(false),
            home_failure: Mutex::new(false),
            homing: Mutex::new(None),
        });
        self.endstops.lock().insert(endstop.pin.clone(), endstop.clone());
        endstop
    }

    fn is_fileoutput(&self) -> bool {
        self.fileoutput
    }

    fn estimated_print_time(&self, eventtime: f64) -> f64 {
        eventtime
    }

    fn force_shutdown(&self) {
        let mut state = self.state.lock();
        if state.shutdown.is_none() {
            state.shutdown = Some("Forced shutdown from host".to_string());
        }
    }

    fn clear_shutdown(&self) {
        self.state.lock().shutdown = None;
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown.is_some()
    }

    fn state_message(&self) -> String {
        self.state
            .lock()
            .shutdown
            .clone()
            .unwrap_or_else(|| "Printer is ready".to_string())
    }
}
