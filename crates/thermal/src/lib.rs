//! # Thermal Management
//!
//! Closed-loop control of resistive heaters: ADC-to-temperature
//! conversion, a swappable control algorithm (bang-bang, PID, relay
//! autotune, bump test), and rate-limited PWM updates stamped on the
//! print-time clock.
//!
//! ADC reports arrive on the transport's I/O thread; each heater guards
//! its sampled state and controller behind one mutex, and everything else
//! is immutable after construction.

pub mod control;
pub mod heater;
pub mod sensor;

pub use control::Control;
pub use heater::{ControlConfig, Heater, HeaterConfig, HeaterError};
pub use sensor::Sensor;

/// Device-side ADC oversampling interval.
pub const SAMPLE_TIME: f64 = 0.001;
/// Device-side ADC oversample count.
pub const SAMPLE_COUNT: u32 = 8;
/// Cadence of ADC reports to the host.
pub const REPORT_TIME: f64 = 0.300;
pub const PWM_CYCLE_TIME: f64 = 0.100;
pub const KELVIN_TO_CELSIUS: f64 = -273.15;
/// Device heater watchdog: outputs not refreshed within this bound are
/// cut by the MCU itself.
pub const MAX_HEAT_TIME: f64 = 5.0;
pub const AMBIENT_TEMP: f64 = 25.0;
/// Config-file PID gains are scaled by this base.
pub const PID_PARAM_BASE: f64 = 255.0;
