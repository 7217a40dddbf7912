//! Process-level glue: shared handles, state message, exit requests, and
//! assembly of all printer objects from the config.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use mcu_io::{Mcu, Reactor};
use motion::CoreXyKinematics;
use thermal::Heater;

use crate::config::PrinterConfig;
use crate::extruder::Extruder;
use crate::fan::PrinterFan;
use crate::gcode::GCodeParser;
use crate::servo::Servo;
use crate::toolhead::Toolhead;

/// Shared process handles the dispatcher reaches for: the transport, the
/// reactor, and the pending exit request.
pub struct Printer {
    pub mcu: Arc<dyn Mcu>,
    pub reactor: Rc<dyn Reactor>,
    state_message: RefCell<String>,
    exit_request: RefCell<Option<String>>,
}

impl Printer {
    pub fn new(mcu: Arc<dyn Mcu>, reactor: Rc<dyn Reactor>) -> Rc<Printer> {
        Rc::new(Printer {
            mcu,
            reactor,
            state_message: RefCell::new(
                "Printer is not ready\nThe host software is still starting up".to_string(),
            ),
            exit_request: RefCell::new(None),
        })
    }

    pub fn set_state_message(&self, msg: &str) {
        *self.state_message.borrow_mut() = msg.to_string();
    }

    /// Status text shown by STATUS and returned for commands issued
    /// before the printer is ready.
    pub fn get_state_message(&self) -> String {
        if self.mcu.is_shutdown() {
            format!(
                "{}\nOnce the underlying issue is corrected, use the \
                 \"CLEAR_SHUTDOWN\" command to clear the shutdown and \
                 restart the printer.",
                self.mcu.state_message()
            )
        } else {
            self.state_message.borrow().clone()
        }
    }

    /// Ask the main loop to exit with `reason` (e.g. "restart",
    /// "exit_eof").
    pub fn request_exit(&self, reason: &str) {
        info!(reason, "exit requested");
        *self.exit_request.borrow_mut() = Some(reason.to_string());
    }

    pub fn exit_requested(&self) -> Option<String> {
        self.exit_request.borrow().clone()
    }
}

/// Build every printer object from the config and wire the G-code parser
/// to `fd`. The parser is left not-ready; callers flip it once the
/// transport is up.
pub fn build_printer(
    config: &PrinterConfig,
    mcu: Arc<dyn Mcu>,
    reactor: Rc<dyn Reactor>,
    fd: RawFd,
    is_fileinput: bool,
) -> Result<Rc<GCodeParser>> {
    if config.printer.kinematics != "corexy" {
        bail!(
            "unsupported kinematics '{}' (only corexy is implemented)",
            config.printer.kinematics
        );
    }
    let kin = CoreXyKinematics::new(
        mcu.as_ref(),
        &config.steppers,
        config.printer.max_z_velocity,
        config.printer.max_z_accel,
    );
    let extruders: Vec<Rc<Extruder>> = config
        .extruders
        .iter()
        .map(|e| {
            Rc::new(Extruder::new(
                e.name.clone(),
                e.index,
                e.nozzle_offset,
                Heater::new(mcu.as_ref(), e.heater.clone()),
                e.activate_delay,
                e.deactivate_delay,
            ))
        })
        .collect();
    if extruders.is_empty() {
        bail!("config defines no [extruder] section");
    }
    let toolhead = Toolhead::new(
        Box::new(kin),
        mcu.clone(),
        reactor.clone(),
        config.printer.max_velocity,
        config.printer.max_accel,
        config.printer.toolchange_velocity,
        extruders,
    );
    let heater_bed = config
        .heater_bed
        .as_ref()
        .map(|cfg| Heater::new(mcu.as_ref(), cfg.clone()));
    let fan = config
        .fan
        .as_ref()
        .map(|cfg| Rc::new(PrinterFan::new(mcu.as_ref(), cfg)));
    let servos: Vec<Rc<Servo>> = config
        .servos
        .iter()
        .map(|cfg| Rc::new(Servo::new(mcu.as_ref(), cfg)))
        .collect();
    let printer = Printer::new(mcu, reactor);
    Ok(GCodeParser::new(
        printer,
        Rc::new(RefCell::new(toolhead)),
        heater_bed,
        fan,
        servos,
        fd,
        is_fileinput,
    ))
}
