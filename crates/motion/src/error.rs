//! Error types for motion checking, dispatch, and homing.

use mcu_io::McuError;
use thiserror::Error;

/// Errors raised while checking or dispatching motion. The out-of-range
/// variants carry the rejected end position for the user-facing message.
#[derive(Debug, Error)]
pub enum MotionError {
    /// The move would end outside the homed axis limits.
    #[error("Move out of range: {0:.3} {1:.3} {2:.3} [{3:.3}]")]
    OutOfRange(f64, f64, f64, f64),
    /// Movement was requested on an axis that has not been homed.
    #[error("Move out of range: {0:.3} {1:.3} {2:.3} [{3:.3}]: Must home axis first")]
    MustHomeFirst(f64, f64, f64, f64),
    /// The transport failed while scheduling steps or homing.
    #[error(transparent)]
    Mcu(#[from] McuError),
}

impl MotionError {
    /// True for errors the G-code stream can recover from by resyncing its
    /// position; transport failures are not recoverable this way.
    pub fn is_endstop_error(&self) -> bool {
        matches!(
            self,
            MotionError::OutOfRange(..) | MotionError::MustHomeFirst(..)
        )
    }
}
