//! # Motion Control
//!
//! Translates Cartesian moves into per-stepper step schedules against the
//! shared print-time clock:
//!
//! - Per-axis stepper configuration and commanded-position tracking
//! - CoreXY kinematics with limit enforcement and Z speed clamping
//! - Trapezoidal velocity profiles, one move at a time
//! - The home/retract/re-home sequence, bounded by endstop triggers

pub mod error;
pub mod homing;
pub mod kinematics;
pub mod profile;
pub mod stepper;

pub use error::MotionError;
pub use homing::{AxisHome, Homing, MotionHost};
pub use kinematics::{Axis, AxisLimit, CoreXyKinematics, Kinematics, MotorChannel};
pub use profile::Move;
pub use stepper::{Stepper, StepperConfig};

/// Logical head position in user units: X, Y, Z, E.
pub type Coord = [f64; 4];
