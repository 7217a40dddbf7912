//! Interfaces to the host's external collaborators: the MCU transport that
//! executes realtime step/PWM timing, and the cooperative I/O reactor that
//! drives all host work.
//!
//! The host core is written against these traits only; the real serial
//! transport and a deterministic in-process fake both implement them. All
//! times are `f64` seconds. "Print time" is the monotonic clock shared
//! between host and MCU that scheduled events are stamped with; the
//! reactor's `monotonic()` is the host-local clock.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the MCU transport.
#[derive(Debug, Clone, Error)]
pub enum McuError {
    /// The transport timed out waiting for a device response.
    #[error("Timeout waiting for MCU response")]
    Timeout,
    /// The device is in a shutdown state and refuses new commands.
    #[error("MCU shutdown: {reason}")]
    Shutdown { reason: String },
    /// A homing move finished without its endstop triggering.
    #[error("No trigger on {name} after full movement")]
    EndstopNotTriggered { name: String },
    /// Malformed or unexpected traffic on the transport.
    #[error("MCU protocol error: {0}")]
    Protocol(String),
}

/// Token identifying a file descriptor registration with the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdHandle(pub usize);

/// Callback invoked when a registered file descriptor becomes readable.
/// The argument is the reactor's monotonic eventtime at dispatch. Shared
/// (`Rc<dyn Fn>`) because a callback that pauses the reactor can be
/// dispatched again re-entrantly while its outer frame is still live;
/// handlers guard against that themselves.
pub type FdCallback = Rc<dyn Fn(f64)>;

/// Cooperative scheduler owned by the printer process. All callbacks run
/// on the reactor's thread; suspension points are explicit `pause` calls.
pub trait Reactor {
    /// Watch `fd` for readability. The callback stays armed until
    /// unregistered, and may itself call back into the reactor.
    fn register_fd(&self, fd: RawFd, callback: FdCallback) -> FdHandle;
    fn unregister_fd(&self, handle: FdHandle);
    /// Host-local monotonic clock, in seconds.
    fn monotonic(&self) -> f64;
    /// Sleep until `waketime`, dispatching fd callbacks as they become
    /// ready, and return the eventtime on wakeup. Handlers that pause
    /// must expect their own registrations to fire re-entrantly.
    fn pause(&self, waketime: f64) -> f64;
}

/// A digital or PWM output pin on the device.
///
/// Digital outputs accept the same interface; any nonzero value drives the
/// pin high.
pub trait McuPwm: Send + Sync {
    fn set_pwm(&self, mcu_time: f64, value: f64);
    fn print_to_mcu_time(&self, print_time: f64) -> f64;
}

/// Callback for periodic ADC reports. Invoked from the transport's I/O
/// thread with `(read_time, normalized_value)`; implementations must do
/// their own locking.
pub type AdcCallback = Arc<dyn Fn(f64, f64) + Send + Sync>;

/// An analog input channel, sampled by the device and reported back to the
/// host at a fixed cadence.
pub trait McuAdc: Send + Sync {
    /// Configure oversampling and the out-of-band shutdown window. A
    /// filtered reading outside `[minval, maxval]` makes the device cut
    /// its outputs without host involvement.
    fn set_minmax(&self, sample_time: f64, sample_count: u32, minval: f64, maxval: f64);
    fn set_adc_callback(&self, report_time: f64, callback: AdcCallback);
}

/// One stepper channel. Step scheduling is expressed as closed-form timing
/// curves the device evaluates itself; both scheduling calls return the
/// count the device actually queued so the host can re-anchor fractional
/// rounding.
pub trait McuStepper: Send + Sync {
    fn set_position(&self, steps: i64);
    fn commanded_position(&self) -> i64;
    fn print_to_mcu_time(&self, print_time: f64) -> f64;
    /// Schedule `steps` steps along `t = sqrt(pos * factor + sqrt_offset)`
    /// relative to `mcu_time`. Used for constant-acceleration segments.
    fn step_sqrt(
        &self,
        mcu_time: f64,
        steps: f64,
        step_offset: f64,
        sqrt_offset: f64,
        factor: f64,
    ) -> Result<f64, McuError>;
    /// Schedule `steps` steps along `t = pos * factor` relative to
    /// `mcu_time`. Used for constant-velocity segments.
    fn step_factor(
        &self,
        mcu_time: f64,
        steps: f64,
        step_offset: f64,
        factor: f64,
    ) -> Result<f64, McuError>;
}

/// An endstop input, optionally bound to steppers that must halt the
/// moment it triggers during homing.
pub trait McuEndstop: Send + Sync {
    fn add_stepper(&self, stepper: Arc<dyn McuStepper>);
    /// Begin trigger sampling for a homing move. `rest_time` is the
    /// sample rest interval, normally one step time at the homing speed.
    fn home_start(&self, mcu_time: f64, rest_time: f64);
    /// Stop sampling at `mcu_time` (the scheduled end of the homing move).
    fn home_finalize(&self, mcu_time: f64) -> Result<(), McuError>;
    /// Block until the homing move ends; errors if the endstop never
    /// triggered.
    fn home_wait(&self) -> Result<(), McuError>;
    /// Request a one-shot state sample at `mcu_time`.
    fn query_endstop(&self, mcu_time: f64);
    /// Collect the sample requested by `query_endstop`.
    fn query_endstop_wait(&self) -> bool;
}

/// The device itself: a factory for pin/channel handles plus process-wide
/// state. Implementations are thread-safe by contract; ADC callbacks are
/// delivered on a background I/O thread while everything else runs on the
/// reactor thread.
pub trait Mcu: Send + Sync {
    fn create_digital_out(&self, pin: &str, max_duration: f64) -> Arc<dyn McuPwm>;
    fn create_pwm(
        &self,
        pin: &str,
        cycle_time: f64,
        initial_value: f64,
        max_duration: f64,
    ) -> Arc<dyn McuPwm>;
    fn create_adc(&self, pin: &str) -> Arc<dyn McuAdc>;
    fn create_stepper(&self, step_pin: &str, dir_pin: &str) -> Arc<dyn McuStepper>;
    fn create_endstop(&self, pin: &str) -> Arc<dyn McuEndstop>;
    /// True when output is being written to a file for simulation rather
    /// than a live device.
    fn is_fileoutput(&self) -> bool;
    /// Estimate of the print-time clock at host monotonic `eventtime`.
    fn estimated_print_time(&self, eventtime: f64) -> f64;
    /// Propagate a fatal host-side condition; the device cuts heaters and
    /// motors and latches the shutdown state.
    fn force_shutdown(&self);
    fn clear_shutdown(&self);
    fn is_shutdown(&self) -> bool;
    /// Human-readable explanation of the current shutdown, if any.
    fn state_message(&self) -> String;
}
