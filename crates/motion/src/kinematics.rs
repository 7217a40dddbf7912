//! CoreXY kinematics: Cartesian/motor transforms, limit enforcement, and
//! per-move step scheduling.

use tracing::debug;

use mcu_io::Mcu;

use crate::error::MotionError;
use crate::homing::{AxisHome, HomingEndstop};
use crate::profile::Move;
use crate::stepper::{Stepper, StepperConfig};
use crate::Coord;

/// Cartesian axis of the logical head position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    pub const XYZ: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::E => 3,
        }
    }
}

/// Belt or leadscrew motor channel. For CoreXY, A and B are the two belt
/// motors whose sum drives X and difference drives Y; they are not
/// Cartesian axes, even though the A/B steppers are configured from the
/// `stepper_x`/`stepper_y` sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorChannel {
    A,
    B,
    Z,
}

impl MotorChannel {
    pub fn index(self) -> usize {
        match self {
            MotorChannel::A => 0,
            MotorChannel::B => 1,
            MotorChannel::Z => 2,
        }
    }
}

/// Per-axis homed range. An unhomed axis gates all movement on it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisLimit {
    Unhomed,
    Homed { lo: f64, hi: f64 },
}

impl AxisLimit {
    fn contains(&self, pos: f64) -> bool {
        match *self {
            AxisLimit::Unhomed => false,
            AxisLimit::Homed { lo, hi } => pos >= lo && pos <= hi,
        }
    }
}

/// Kinematic model seam: the toolhead drives motion through this trait.
pub trait Kinematics {
    /// Force the commanded stepper positions to match `newpos`.
    fn set_position(&mut self, newpos: Coord);
    /// Record the homing limits for `axis` and produce its three-phase
    /// approach plan, or `None` when the axis has no stepper.
    fn plan_home(&mut self, axis: Axis) -> Option<AxisHome>;
    /// Validate a move against the axis limits and clamp its speed for
    /// slow axes. May lower the move's profile; never dispatches it.
    fn check_move(&self, m: &mut Move) -> Result<(), MotionError>;
    /// Schedule the move's step segments starting at `move_time`.
    fn dispatch_move(&mut self, move_time: f64, m: &Move) -> Result<(), MotionError>;
    /// Disable all motors and drop back to the unhomed state.
    fn motor_off(&mut self, move_time: f64);
    /// Sample every endstop at `print_time`; returns (name, triggered).
    fn query_endstops(&self, print_time: f64) -> Vec<(String, bool)>;
}

/// CoreXY: two belt motors whose rotations add to produce X motion and
/// subtract to produce Y motion, plus an independent Z.
///
/// `steppers` is indexed by [`MotorChannel`] while `limits` is indexed by
/// Cartesian axis; the two index spaces only coincide for Z.
pub struct CoreXyKinematics {
    steppers: [Stepper; 3],
    limits: [AxisLimit; 3],
    max_z_velocity: f64,
    max_z_accel: f64,
    need_motor_enable: bool,
}

impl CoreXyKinematics {
    pub fn new(
        mcu: &dyn Mcu,
        configs: &[StepperConfig; 3],
        max_z_velocity: f64,
        max_z_accel: f64,
    ) -> CoreXyKinematics {
        let steppers = [
            Stepper::new(mcu, &configs[0]),
            Stepper::new(mcu, &configs[1]),
            Stepper::new(mcu, &configs[2]),
        ];
        // A triggered endstop during homing must halt both belts
        // synchronously, so each belt endstop also watches the partner
        // belt's stepper.
        steppers[MotorChannel::A.index()]
            .mcu_endstop
            .add_stepper(steppers[MotorChannel::B.index()].mcu_stepper.clone());
        steppers[MotorChannel::B.index()]
            .mcu_endstop
            .add_stepper(steppers[MotorChannel::A.index()].mcu_stepper.clone());
        CoreXyKinematics {
            steppers,
            limits: [AxisLimit::Unhomed; 3],
            max_z_velocity,
            max_z_accel,
            need_motor_enable: true,
        }
    }

    /// Forward transform from Cartesian position to motor travel.
    pub fn motor_from_cartesian(pos: &Coord) -> [f64; 3] {
        [pos[0] + pos[1], pos[0] - pos[1], pos[2]]
    }

    /// Inverse of [`motor_from_cartesian`].
    pub fn cartesian_from_motor(motor: &[f64; 3]) -> [f64; 3] {
        [
            0.5 * (motor[0] + motor[1]),
            0.5 * (motor[0] - motor[1]),
            motor[2],
        ]
    }

    fn check_endstops(&self, m: &Move) -> Result<(), MotionError> {
        let end = m.end_pos;
        for axis in Axis::XYZ {
            let i = axis.index();
            if m.axes_d[i] != 0. && !self.limits[i].contains(end[i]) {
                if self.limits[i] == AxisLimit::Unhomed {
                    return Err(MotionError::MustHomeFirst(end[0], end[1], end[2], end[3]));
                }
                return Err(MotionError::OutOfRange(end[0], end[1], end[2], end[3]));
            }
        }
        Ok(())
    }

    fn check_motor_enable(&mut self, move_time: f64, m: &Move) {
        if m.axes_d[0] != 0. || m.axes_d[1] != 0. {
            self.steppers[MotorChannel::A.index()].motor_enable(move_time, true);
            self.steppers[MotorChannel::B.index()].motor_enable(move_time, true);
        }
        if m.axes_d[2] != 0. {
            self.steppers[MotorChannel::Z.index()].motor_enable(move_time, true);
        }
        self.need_motor_enable = self.steppers.iter().any(|s| s.need_motor_enable);
    }
}

impl Kinematics for CoreXyKinematics {
    fn set_position(&mut self, newpos: Coord) {
        let pos = Self::motor_from_cartesian(&newpos);
        for (i, s) in self.steppers.iter().enumerate() {
            let steps = pos[i] * s.inv_step_dist;
            // Round half away from zero
            let steppos = if steps >= 0. {
                (steps + 0.5) as i64
            } else {
                (steps - 0.5) as i64
            };
            s.mcu_stepper.set_position(steppos);
        }
    }

    fn plan_home(&mut self, axis: Axis) -> Option<AxisHome> {
        // Belt A carries the X axis homing config, belt B carries Y.
        let channel = match axis {
            Axis::X => MotorChannel::A,
            Axis::Y => MotorChannel::B,
            Axis::Z => MotorChannel::Z,
            Axis::E => return None,
        };
        let s = &self.steppers[channel.index()];
        self.limits[axis.index()] = AxisLimit::Homed {
            lo: s.position_min,
            hi: s.position_max,
        };
        // Determine the three-phase approach: overshoot past the endstop,
        // retract, then re-home slowly from just off the switch.
        let (first_pos, retract_pos, second_pos) = if s.homing_positive_dir {
            let pos = s.position_endstop - 1.5 * (s.position_endstop - s.position_min);
            let rpos = s.position_endstop - s.homing_retract_dist;
            (pos, rpos, rpos - s.homing_retract_dist)
        } else {
            let pos = s.position_endstop + 1.5 * (s.position_max - s.position_endstop);
            let rpos = s.position_endstop + s.homing_retract_dist;
            (pos, rpos, rpos + s.homing_retract_dist)
        };
        Some(AxisHome {
            axis,
            endstop_pos: s.position_endstop,
            first_pos,
            retract_pos,
            second_pos,
            speed: s.homing_speed,
            endstops: vec![HomingEndstop {
                endstop: s.mcu_endstop.clone(),
                name: s.name.clone(),
                step_dist: s.step_dist,
            }],
        })
    }

    fn check_move(&self, m: &mut Move) -> Result<(), MotionError> {
        let (xpos, ypos) = (m.end_pos[0], m.end_pos[1]);
        if !self.limits[0].contains(xpos) || !self.limits[1].contains(ypos) {
            self.check_endstops(m)?;
        }
        if m.axes_d[2] == 0. {
            // Normal XY move - use defaults
            return Ok(());
        }
        // Move with Z - update velocity and accel for slower Z axis
        self.check_endstops(m)?;
        let z_ratio = m.move_d / m.axes_d[2].abs();
        m.limit_speed(self.max_z_velocity * z_ratio, self.max_z_accel * z_ratio);
        Ok(())
    }

    fn dispatch_move(&mut self, move_time: f64, m: &Move) -> Result<(), MotionError> {
        if self.need_motor_enable {
            self.check_motor_enable(move_time, m);
        }
        let inv_accel = 1. / m.accel;
        let inv_cruise_v = 1. / m.cruise_v;
        let start_pos = Self::motor_from_cartesian(&m.start_pos);
        let axes_d = [
            m.axes_d[0] + m.axes_d[1],
            m.axes_d[0] - m.axes_d[1],
            m.axes_d[2],
        ];
        debug!(
            move_d = m.move_d,
            accel_r = m.accel_r,
            cruise_r = m.cruise_r,
            decel_r = m.decel_r,
            motor_d = ?axes_d,
            "dispatch move"
        );
        for (i, s) in self.steppers.iter().enumerate() {
            if axes_d[i] == 0. {
                continue;
            }
            let mcu_stepper = &s.mcu_stepper;
            let mut mcu_time = mcu_stepper.print_to_mcu_time(move_time);
            let step_pos = mcu_stepper.commanded_position() as f64;
            // Residual between the device's integer-step reality and the
            // continuous motion's starting point.
            let mut step_offset = step_pos - start_pos[i] * s.inv_step_dist;
            let steps = axes_d[i] * s.inv_step_dist;
            let move_step_d = m.move_d / steps.abs();

            // Acceleration steps
            let accel_multiplier = 2. * move_step_d * inv_accel;
            if m.accel_r != 0. {
                // t = sqrt(2*pos/accel + (start_v/accel)**2) - start_v/accel
                let accel_time_offset = m.start_v * inv_accel;
                let accel_sqrt_offset = accel_time_offset * accel_time_offset;
                let accel_steps = m.accel_r * steps;
                let count = mcu_stepper.step_sqrt(
                    mcu_time - accel_time_offset,
                    accel_steps,
                    step_offset,
                    accel_sqrt_offset,
                    accel_multiplier,
                )?;
                step_offset += count - accel_steps;
                mcu_time += m.accel_t;
            }
            // Cruising steps
            if m.cruise_r != 0. {
                // t = pos/cruise_v
                let cruise_multiplier = move_step_d * inv_cruise_v;
                let cruise_steps = m.cruise_r * steps;
                let count =
                    mcu_stepper.step_factor(mcu_time, cruise_steps, step_offset, cruise_multiplier)?;
                step_offset += count - cruise_steps;
                mcu_time += m.cruise_t;
            }
            // Deceleration steps
            if m.decel_r != 0. {
                // t = cruise_v/accel - sqrt((cruise_v/accel)**2 - 2*pos/accel)
                let decel_time_offset = m.cruise_v * inv_accel;
                let decel_sqrt_offset = decel_time_offset * decel_time_offset;
                let decel_steps = m.decel_r * steps;
                mcu_stepper.step_sqrt(
                    mcu_time + decel_time_offset,
                    decel_steps,
                    step_offset,
                    decel_sqrt_offset,
                    -accel_multiplier,
                )?;
            }
        }
        Ok(())
    }

    fn motor_off(&mut self, move_time: f64) {
        self.limits = [AxisLimit::Unhomed; 3];
        for s in self.steppers.iter_mut() {
            s.motor_enable(move_time, false);
        }
        self.need_motor_enable = true;
        debug!("motors off");
    }

    fn query_endstops(&self, print_time: f64) -> Vec<(String, bool)> {
        // Start every query before collecting, so all samples land on the
        // same print time.
        for s in &self.steppers {
            let mcu_time = s.mcu_stepper.print_to_mcu_time(print_time);
            s.mcu_endstop.query_endstop(mcu_time);
        }
        self.steppers
            .iter()
            .map(|s| (s.name.clone(), s.mcu_endstop.query_endstop_wait()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use mcu_io::McuStepper;
    use sim::SimMcu;

    fn stepper_config(name: &str) -> StepperConfig {
        StepperConfig {
            name: name.to_string(),
            step_pin: format!("{}_step", name),
            dir_pin: format!("{}_dir", name),
            enable_pin: Some(format!("{}_enable", name)),
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

    fn build_kin(mcu: &SimMcu) -> CoreXyKinematics {
        let configs = [
            stepper_config("stepper_x"),
            stepper_config("stepper_y"),
            stepper_config("stepper_z"),
        ];
        CoreXyKinematics::new(mcu, &configs, 5., 100.)
    }

    fn home_all(kin: &mut CoreXyKinematics) {
        for axis in Axis::XYZ {
            kin.plan_home(axis);
        }
    }

    #[test]
    fn belt_endstops_watch_both_belts() {
        let mcu = SimMcu::new(false);
        let _kin = build_kin(&mcu);
        // Each belt endstop halts its own stepper plus the partner belt
        assert_eq!(mcu.endstop("stepper_x_stop").unwrap().watched_steppers(), 2);
        assert_eq!(mcu.endstop("stepper_y_stop").unwrap().watched_steppers(), 2);
        assert_eq!(mcu.endstop("stepper_z_stop").unwrap().watched_steppers(), 1);
    }

    #[test]
    fn corexy_round_trip() {
        for (x, y, z) in [(0., 0., 0.), (10., 3., 1.), (-7.25, 4.5, 0.1)] {
            let motor = CoreXyKinematics::motor_from_cartesian(&[x, y, z, 0.]);
            let cart = CoreXyKinematics::cartesian_from_motor(&motor);
            assert!(approx_eq!(f64, cart[0], x, epsilon = 1e-12));
            assert!(approx_eq!(f64, cart[1], y, epsilon = 1e-12));
            assert!(approx_eq!(f64, cart[2], z, epsilon = 1e-12));
        }
    }

    #[test]
    fn set_position_rounds_half_away_from_zero() {
        let mcu = SimMcu::new(false);
        let mut kin = build_kin(&mcu);
        // x=0.1, y=0.09375 => a=0.19375 (15.5 steps), b=0.00625 (0.5 steps)
        kin.set_position([0.1, 0.09375, -0.00625, 0.]);
        let a = mcu.stepper("stepper_x_step").unwrap();
        let b = mcu.stepper("stepper_y_step").unwrap();
        let z = mcu.stepper("stepper_z_step").unwrap();
        assert_eq!(a.commanded_position(), 16);
        assert_eq!(b.commanded_position(), 1);
        assert_eq!(z.commanded_position(), -1);
    }

    #[test]
    fn unhomed_axis_gates_movement() {
        let mcu = SimMcu::new(false);
        let kin = build_kin(&mcu);
        let mut m = Move::new([0.; 4], [10., 0., 0., 0.], 50., 1000.);
        match kin.check_move(&mut m) {
            Err(MotionError::MustHomeFirst(..)) => {}
            other => panic!("expected must-home error, got {:?}", other.err()),
        }
    }

    #[test]
    fn out_of_range_after_homing() {
        let mcu = SimMcu::new(false);
        let mut kin = build_kin(&mcu);
        home_all(&mut kin);
        let mut m = Move::new([0.; 4], [250., 0., 0., 0.], 50., 1000.);
        match kin.check_move(&mut m) {
            Err(MotionError::OutOfRange(..)) => {}
            other => panic!("expected out-of-range error, got {:?}", other.err()),
        }
        let mut ok = Move::new([0.; 4], [50., 20., 0., 0.], 50., 1000.);
        kin.check_move(&mut ok).unwrap();
    }

    #[test]
    fn z_move_is_speed_clamped() {
        let mcu = SimMcu::new(false);
        let mut kin = build_kin(&mcu);
        home_all(&mut kin);
        let mut m = Move::new([0.; 4], [0., 0., 10., 0.], 50., 1000.);
        kin.check_move(&mut m).unwrap();
        // Pure Z move: z_ratio is 1, so max_z_velocity/max_z_accel apply
        assert!(approx_eq!(f64, m.cruise_v, 5., epsilon = 1e-9));
        assert_eq!(m.accel, 100.);
    }

    #[test]
    fn scheduled_steps_match_commanded_delta() {
        let mcu = SimMcu::new(false);
        let mut kin = build_kin(&mcu);
        home_all(&mut kin);
        let start = [1.0003, 2.0007, 0.5001, 0.];
        let end = [11.07, 0.0042, 0.5001, 0.];
        kin.set_position(start);
        let mut m = Move::new(start, end, 50., 1000.);
        kin.check_move(&mut m).unwrap();
        kin.dispatch_move(10., &m).unwrap();

        let inv = 1. / 0.0125;
        let ms = CoreXyKinematics::motor_from_cartesian(&start);
        let me = CoreXyKinematics::motor_from_cartesian(&end);
        for (channel, pin) in [(0, "stepper_x_step"), (1, "stepper_y_step")] {
            let expected = (me[channel] * inv).round() - (ms[channel] * inv).round();
            let total: f64 = mcu
                .step_log()
                .iter()
                .filter(|r| r.stepper == pin)
                .map(|r| r.count)
                .sum();
            assert!(
                approx_eq!(f64, total, expected, epsilon = 1e-9),
                "channel {}: scheduled {} expected {}",
                channel,
                total,
                expected
            );
        }
        // No Z travel, so no Z segments were scheduled
        assert!(mcu
            .step_log()
            .iter()
            .all(|r| r.stepper != "stepper_z_step"));
    }

    #[test]
    fn count_skew_is_reanchored() {
        let mcu = SimMcu::new(false);
        let mut kin = build_kin(&mcu);
        home_all(&mut kin);
        kin.set_position([0.; 4]);
        // Make the device report three extra steps on belt A's first
        // segment; the step_offset fold must absorb them so the move
        // still lands on the commanded endpoint.
        mcu.stepper("stepper_x_step").unwrap().set_count_skew(3);
        let mut m = Move::new([0.; 4], [10., 0., 0., 0.], 50., 1000.);
        kin.check_move(&mut m).unwrap();
        kin.dispatch_move(5., &m).unwrap();
        let expected = 10. / 0.0125;
        for pin in ["stepper_x_step", "stepper_y_step"] {
            let total: f64 = mcu
                .step_log()
                .iter()
                .filter(|r| r.stepper == pin)
                .map(|r| r.count)
                .sum();
            assert!(approx_eq!(f64, total, expected, epsilon = 1e-9), "{}", pin);
        }
        assert_eq!(
            mcu.stepper("stepper_x_step").unwrap().commanded_position(),
            800
        );
    }

    #[test]
    fn motor_off_resets_homing() {
        let mcu = SimMcu::new(false);
        let mut kin = build_kin(&mcu);
        home_all(&mut kin);
        let mut m = Move::new([0.; 4], [10., 0., 0., 0.], 50., 1000.);
        kin.check_move(&mut m).unwrap();
        kin.motor_off(1.);
        match kin.check_move(&mut m) {
            Err(MotionError::MustHomeFirst(..)) => {}
            other => panic!("expected must-home error, got {:?}", other.err()),
        }
    }
}
