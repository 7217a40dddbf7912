//! The toolhead: print-time cursor plus fan-out to the kinematics.

use std::rc::Rc;
use std::sync::Arc;

use mcu_io::{Mcu, Reactor};
use motion::{Coord, Homing, Kinematics, MotionError, MotionHost, Move};

use crate::extruder::Extruder;

/// How far ahead of the estimated device clock new work is scheduled.
const BUFFER_TIME: f64 = 0.250;

/// Owns the kinematics and the monotonically-increasing print-time
/// cursor every motion and heater command is serialized through.
pub struct Toolhead {
    kin: Box<dyn Kinematics>,
    mcu: Arc<dyn Mcu>,
    reactor: Rc<dyn Reactor>,
    commanded_pos: Coord,
    print_time: f64,
    max_velocity: f64,
    max_accel: f64,
    pub toolchange_velocity: f64,
    pub extruders: Vec<Rc<Extruder>>,
    pub current_extruder: usize,
}

impl Toolhead {
    pub fn new(
        kin: Box<dyn Kinematics>,
        mcu: Arc<dyn Mcu>,
        reactor: Rc<dyn Reactor>,
        max_velocity: f64,
        max_accel: f64,
        toolchange_velocity: f64,
        extruders: Vec<Rc<Extruder>>,
    ) -> Toolhead {
        Toolhead {
            kin,
            mcu,
            reactor,
            commanded_pos: [0.; 4],
            print_time: 0.,
            max_velocity,
            max_accel,
            toolchange_velocity,
            extruders,
            current_extruder: 0,
        }
    }

    pub fn current_extruder(&self) -> Rc<Extruder> {
        self.extruders[self.current_extruder].clone()
    }

    /// The authoritative commanded head position.
    pub fn get_position(&self) -> Coord {
        self.commanded_pos
    }

    pub fn set_position(&mut self, pos: Coord) {
        self.commanded_pos = pos;
        self.kin.set_position(pos);
    }

    /// Check, profile, and dispatch one move, advancing the print-time
    /// cursor by its duration.
    pub fn move_to(&mut self, newpos: Coord, speed: f64) -> Result<(), MotionError> {
        let mut m = Move::new(
            self.commanded_pos,
            newpos,
            speed.min(self.max_velocity),
            self.max_accel,
        );
        if m.is_motionless() {
            return Ok(());
        }
        if m.move_d == 0. {
            // Extrude-only move: nothing for the kinematics, but the time
            // axis still advances by the extrusion duration
            self.commanded_pos = newpos;
            if speed > 0. {
                let extrude_t = m.axes_d[3].abs() / speed.min(self.max_velocity);
                self.print_time = self.get_last_move_time() + extrude_t;
            }
            return Ok(());
        }
        self.kin.check_move(&mut m)?;
        let move_time = self.get_last_move_time();
        self.kin.dispatch_move(move_time, &m)?;
        self.commanded_pos = newpos;
        self.print_time = move_time + m.total_time();
        Ok(())
    }

    /// The cursor, pushed ahead of the device clock so newly scheduled
    /// work is always in the future.
    pub fn get_last_move_time(&mut self) -> f64 {
        let est = self.mcu.estimated_print_time(self.reactor.monotonic());
        if self.print_time < est + BUFFER_TIME {
            self.print_time = est + BUFFER_TIME;
        }
        self.print_time
    }

    /// Re-anchor the cursor to the present; used after homing moves that
    /// an endstop trigger cut short.
    pub fn reset_print_time(&mut self) {
        self.print_time = self.mcu.estimated_print_time(self.reactor.monotonic()) + BUFFER_TIME;
    }

    pub fn dwell(&mut self, delay: f64) {
        self.print_time = self.get_last_move_time() + delay;
    }

    /// Current cursor value without pushing it forward; the M400 wait
    /// loop polls this between reactor pauses.
    pub fn print_time(&self) -> f64 {
        self.print_time
    }

    pub fn motor_off(&mut self) {
        let move_time = self.get_last_move_time();
        self.kin.motor_off(move_time);
    }

    pub fn force_shutdown(&self) {
        self.mcu.force_shutdown();
    }

    /// Home the requested axes in order, one full three-phase sequence
    /// each. The final homed position is whatever the sequence's forced
    /// and endstop coordinates left behind.
    pub fn home(&mut self, homing: &mut Homing) -> Result<(), MotionError> {
        for axis in homing.axes().to_vec() {
            let Some(plan) = self.kin.plan_home(axis) else {
                continue;
            };
            homing.home_axis(self, &plan)?;
        }
        Ok(())
    }

    pub fn query_endstops(&mut self) -> Vec<(String, bool)> {
        let print_time = self.get_last_move_time();
        self.kin.query_endstops(print_time)
    }
}

impl MotionHost for Toolhead {
    fn get_position(&self) -> Coord {
        Toolhead::get_position(self)
    }

    fn set_position(&mut self, pos: Coord) {
        Toolhead::set_position(self, pos)
    }

    fn move_to(&mut self, pos: Coord, speed: f64) -> Result<(), MotionError> {
        Toolhead::move_to(self, pos, speed)
    }

    fn get_last_move_time(&mut self) -> f64 {
        Toolhead::get_last_move_time(self)
    }

    fn reset_print_time(&mut self) {
        Toolhead::reset_print_time(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motion::{Axis, CoreXyKinematics, MotionError, StepperConfig};
    use sim::{SimMcu, SimReactor};
    use thermal::{ControlConfig, Heater, HeaterConfig, Sensor};

    fn stepper_config(name: &str) -> StepperConfig {
        StepperConfig {
            name: name.to_string(),
            step_pin: format!("{}_step", name),
            dir_pin: format!("{}_dir", name),
            enable_pin: None,
            endstop_pin: format!("{}_stop", name),
            step_dist: 0.0125,
            position_min: 0.,
            position_max: 200.,
            position_endstop: 0.,
            homing_speed: 50.,
            homing_retract_dist: 5.,
            homing_positive_dir: false,
        }
    }

    fn build_toolhead() -> (Toolhead, Arc<SimMcu>, Rc<SimReactor>) {
        let mcu = Arc::new(SimMcu::new(false));
        let reactor = Rc::new(SimReactor::new());
        let configs = [
            stepper_config("stepper_x"),
            stepper_config("stepper_y"),
            stepper_config("stepper_z"),
        ];
        let kin = CoreXyKinematics::new(mcu.as_ref(), &configs, 25., 100.);
        let heater = Heater::new(
            mcu.as_ref(),
            HeaterConfig {
                name: "extruder".to_string(),
                heater_pin: "e_heat".to_string(),
                sensor_pin: "e_temp".to_string(),
                sensor: Sensor::Linear {
                    gain: 250.,
                    offset: 0.,
                },
                control: ControlConfig::Watermark { max_delta: 2. },
                min_temp: 0.,
                max_temp: 250.,
                min_extrude_temp: 170.,
                max_power: 1.,
            },
        );
        let extruder = Rc::new(Extruder::new(
            "extruder".to_string(),
            0,
            [0.; 3],
            heater,
            0.,
            0.,
        ));
        let toolhead = Toolhead::new(
            Box::new(kin),
            mcu.clone(),
            reactor.clone(),
            300.,
            3000.,
            50.,
            vec![extruder],
        );
        (toolhead, mcu, reactor)
    }

    #[test]
    fn cursor_stays_ahead_of_the_device_clock() {
        let (mut toolhead, _mcu, reactor) = build_toolhead();
        assert_eq!(toolhead.get_last_move_time(), 0.25);
        toolhead.dwell(1.);
        assert_eq!(toolhead.print_time(), 1.25);
        // Once the device clock passes the cursor, it snaps forward again
        reactor.advance(10.);
        assert_eq!(toolhead.get_last_move_time(), 10.25);
        toolhead.reset_print_time();
        assert_eq!(toolhead.print_time(), 10.25);
    }

    #[test]
    fn moves_advance_the_cursor_by_their_duration() {
        let (mut toolhead, _mcu, _reactor) = build_toolhead();
        let mut homing = motion::Homing::new(vec![Axis::X, Axis::Y, Axis::Z]);
        toolhead.home(&mut homing).unwrap();
        toolhead.reset_print_time();
        let before = toolhead.get_last_move_time();
        toolhead.move_to([30., 0., 0., 0.], 60.).unwrap();
        // 30mm at 60mm/s with 3000mm/s^2 ramps: 0.52s total
        let expected = 30. / 60. + 60. / 3000.;
        assert!((toolhead.print_time() - (before + expected)).abs() < 1e-9);
    }

    #[test]
    fn extrude_only_moves_skip_the_kinematics() {
        let (mut toolhead, mcu, _reactor) = build_toolhead();
        let before = toolhead.get_last_move_time();
        toolhead.move_to([0., 0., 0., 5.], 25.).unwrap();
        assert_eq!(toolhead.get_position()[3], 5.);
        assert!(mcu.step_log().is_empty());
        assert!((toolhead.print_time() - (before + 0.2)).abs() < 1e-9);
    }

    #[test]
    fn unhomed_moves_are_rejected() {
        let (mut toolhead, _mcu, _reactor) = build_toolhead();
        let err = toolhead.move_to([10., 0., 0., 0.], 60.);
        assert!(matches!(err, Err(MotionError::MustHomeFirst(..))));
    }
}
