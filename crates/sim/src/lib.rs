//! Deterministic in-process fakes of the MCU transport and the reactor.
//!
//! `SimMcu` implements the full `mcu-io` surface against an in-memory
//! log: step scheduling calls, PWM writes, and shutdown state are all
//! recorded for inspection. Tests drive ADC reports by hand (or from a
//! real background thread, to exercise cross-thread locking) and script
//! endstop behavior. The same fake backs the host's file-output mode.

pub mod mcu;
pub mod reactor;

pub use mcu::{PwmRecord, SimAdc, SimEndstop, SimMcu, SimStepper, StepKind, StepRecord};
pub use reactor::SimReactor;
