//! # printd host
//!
//! The host-side control core of the printer: a line-oriented G-code
//! parser and dispatcher that owns the logical print position, a toolhead
//! that fans commands out to the CoreXY kinematics and heaters, and the
//! glue (config, reactor, servo, fan) around them.
//!
//! A single cooperative reactor drives everything; the only cross-thread
//! traffic is ADC delivery into the heaters, which synchronize
//! internally.

pub mod config;
pub mod extruder;
pub mod fan;
pub mod gcode;
pub mod printer;
pub mod reactor;
pub mod servo;
pub mod toolhead;
