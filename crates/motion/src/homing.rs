//! The home/retract/re-home sequence, bounded by endstop triggers.

use std::sync::Arc;

use tracing::debug;

use mcu_io::McuEndstop;

use crate::error::MotionError;
use crate::kinematics::Axis;
use crate::Coord;

/// Partial coordinate: axes set to `None` keep their current value.
pub type PartialCoord = [Option<f64>; 4];

/// An endstop to arm for the duration of a homing move.
pub struct HomingEndstop {
    pub endstop: Arc<dyn McuEndstop>,
    pub name: String,
    /// Step distance of the owning stepper; sets the trigger sample rest
    /// interval at a given homing speed.
    pub step_dist: f64,
}

/// Three-phase approach for one axis, produced by the kinematics when the
/// axis limits are recorded.
pub struct AxisHome {
    pub axis: Axis,
    /// Where the axis physically rests once its endstop triggers.
    pub endstop_pos: f64,
    /// Forced start of the initial home: 1.5x past the endstop, so the
    /// move always reaches the switch.
    pub first_pos: f64,
    pub retract_pos: f64,
    /// Forced start of the slow verification re-home.
    pub second_pos: f64,
    pub speed: f64,
    pub endstops: Vec<HomingEndstop>,
}

/// Operations the homing sequence needs from the toolhead.
pub trait MotionHost {
    fn get_position(&self) -> Coord;
    fn set_position(&mut self, pos: Coord);
    fn move_to(&mut self, pos: Coord, speed: f64) -> Result<(), MotionError>;
    fn get_last_move_time(&mut self) -> f64;
    /// Re-anchor the print-time cursor after a move that was cut short by
    /// an endstop trigger.
    fn reset_print_time(&mut self);
}

/// Drives a home/retract/re-home sequence across the requested axes.
/// Built per G28 and discarded afterwards.
pub struct Homing {
    axes: Vec<Axis>,
    verify_retract: bool,
}

impl Homing {
    pub fn new(axes: Vec<Axis>) -> Homing {
        Homing {
            axes,
            verify_retract: true,
        }
    }

    /// Skip the verification re-home; used when replaying from a file.
    pub fn set_no_verify_retract(&mut self) {
        self.verify_retract = false;
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    fn fill_coord(host: &dyn MotionHost, coord: PartialCoord) -> Coord {
        let mut out = host.get_position();
        for (i, c) in coord.iter().enumerate() {
            if let Some(v) = c {
                out[i] = *v;
            }
        }
        out
    }

    /// Drive one endstop-bounded move: force the host position to
    /// `force_pos`, arm the endstops, move toward `move_pos`, and fail if
    /// no endstop triggered. The position recorded afterwards is whatever
    /// the forced coordinates and the trigger left behind.
    pub fn home(
        &mut self,
        host: &mut dyn MotionHost,
        endstops: &[HomingEndstop],
        force_pos: PartialCoord,
        move_pos: PartialCoord,
        speed: f64,
        second_home: bool,
    ) -> Result<(), MotionError> {
        if second_home && !self.verify_retract {
            return Ok(());
        }
        let forced = Self::fill_coord(host, force_pos);
        host.set_position(forced);
        let print_time = host.get_last_move_time();
        for es in endstops {
            es.endstop.home_start(print_time, es.step_dist / speed);
        }
        host.move_to(Self::fill_coord(host, move_pos), speed)?;
        let move_end_time = host.get_last_move_time();
        host.reset_print_time();
        for es in endstops {
            es.endstop.home_finalize(move_end_time)?;
        }
        for es in endstops {
            es.endstop.home_wait()?;
        }
        Ok(())
    }

    pub fn retract(
        &self,
        host: &mut dyn MotionHost,
        pos: PartialCoord,
        speed: f64,
    ) -> Result<(), MotionError> {
        host.move_to(Self::fill_coord(host, pos), speed)
    }

    /// Run the full three-phase sequence for one axis: long initial home,
    /// short retract, slow re-home.
    pub fn home_axis(
        &mut self,
        host: &mut dyn MotionHost,
        plan: &AxisHome,
    ) -> Result<(), MotionError> {
        debug!(axis = ?plan.axis, "homing axis");
        let i = plan.axis.index();
        let mut force = [None; 4];
        let mut target = [None; 4];
        target[i] = Some(plan.endstop_pos);
        // Initial homing
        force[i] = Some(plan.first_pos);
        self.home(host, &plan.endstops, force, target, plan.speed, false)?;
        // Retract
        let mut retract = [None; 4];
        retract[i] = Some(plan.retract_pos);
        self.retract(host, retract, plan.speed)?;
        // Home again, slower
        force[i] = Some(plan.second_pos);
        self.home(host, &plan.endstops, force, target, plan.speed / 2., true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcu_io::Mcu;
    use sim::SimMcu;

    /// Records toolhead traffic so the phase ordering can be asserted.
    struct RecordingHost {
        pos: Coord,
        log: Vec<String>,
    }

    impl MotionHost for RecordingHost {
        fn get_position(&self) -> Coord {
            self.pos
        }
        fn set_position(&mut self, pos: Coord) {
            self.pos = pos;
            self.log.push(format!("set {:.1}", pos[0]));
        }
        fn move_to(&mut self, pos: Coord, speed: f64) -> Result<(), MotionError> {
            self.pos = pos;
            self.log.push(format!("move {:.1} @{:.1}", pos[0], speed));
            Ok(())
        }
        fn get_last_move_time(&mut self) -> f64 {
            1.
        }
        fn reset_print_time(&mut self) {
            self.log.push("reset".to_string());
        }
    }

    fn test_plan(mcu: &SimMcu) -> AxisHome {
        let endstop = mcu.create_endstop("x_stop");
        AxisHome {
            axis: Axis::X,
            endstop_pos: 0.,
            first_pos: 300.,
            retract_pos: 5.,
            second_pos: 10.,
            speed: 50.,
            endstops: vec![HomingEndstop {
                endstop,
                name: "stepper_x".to_string(),
                step_dist: 0.0125,
            }],
        }
    }

    #[test]
    fn three_phase_sequence() {
        let mcu = SimMcu::new(false);
        let plan = test_plan(&mcu);
        let mut host = RecordingHost {
            pos: [0.; 4],
            log: vec![],
        };
        let mut homing = Homing::new(vec![Axis::X]);
        homing.home_axis(&mut host, &plan).unwrap();
        assert_eq!(
            host.log,
            vec![
                "set 300.0",
                "move 0.0 @50.0",
                "reset",
                "move 5.0 @50.0",
                "set 10.0",
                "move 0.0 @25.0",
                "reset",
            ]
        );
    }

    #[test]
    fn no_verify_retract_skips_second_home() {
        let mcu = SimMcu::new(false);
        let plan = test_plan(&mcu);
        let mut host = RecordingHost {
            pos: [0.; 4],
            log: vec![],
        };
        let mut homing = Homing::new(vec![Axis::X]);
        homing.set_no_verify_retract();
        homing.home_axis(&mut host, &plan).unwrap();
        assert_eq!(
            host.log,
            vec!["set 300.0", "move 0.0 @50.0", "reset", "move 5.0 @50.0"]
        );
    }

    #[test]
    fn untriggered_endstop_fails_the_home() {
        let mcu = SimMcu::new(false);
        let plan = test_plan(&mcu);
        mcu.endstop("x_stop").unwrap().set_home_failure(true);
        let mut host = RecordingHost {
            pos: [0.; 4],
            log: vec![],
        };
        let mut homing = Homing::new(vec![Axis::X]);
        let err = homing.home_axis(&mut host, &plan);
        assert!(matches!(err, Err(MotionError::Mcu(_))));
    }
}
