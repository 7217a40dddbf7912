//! Trapezoidal velocity profiles for single moves.

use crate::Coord;

/// A single Cartesian move with a fully determined trapezoidal velocity
/// profile. Created per G-code command and consumed by one kinematics
/// dispatch.
///
/// The profile always starts and ends at rest: with no lookahead, each
/// move owns its full acceleration and deceleration ramps. The three
/// ratios satisfy `accel_r + cruise_r + decel_r == 1.0` whenever
/// `move_d > 0`.
#[derive(Debug, Clone)]
pub struct Move {
    pub start_pos: Coord,
    pub end_pos: Coord,
    /// Signed per-axis deltas (X, Y, Z, E).
    pub axes_d: Coord,
    /// Euclidean XYZ travel distance. Zero for extruder-only moves.
    pub move_d: f64,
    pub accel: f64,
    pub start_v: f64,
    pub cruise_v: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    pub accel_r: f64,
    pub cruise_r: f64,
    pub decel_r: f64,
    max_cruise_v: f64,
}

impl Move {
    pub fn new(start_pos: Coord, end_pos: Coord, speed: f64, accel: f64) -> Move {
        let axes_d = [
            end_pos[0] - start_pos[0],
            end_pos[1] - start_pos[1],
            end_pos[2] - start_pos[2],
            end_pos[3] - start_pos[3],
        ];
        let move_d =
            (axes_d[0] * axes_d[0] + axes_d[1] * axes_d[1] + axes_d[2] * axes_d[2]).sqrt();
        let mut m = Move {
            start_pos,
            end_pos,
            axes_d,
            move_d,
            accel,
            start_v: 0.,
            cruise_v: 0.,
            accel_t: 0.,
            cruise_t: 0.,
            decel_t: 0.,
            accel_r: 0.,
            cruise_r: 0.,
            decel_r: 0.,
            max_cruise_v: speed,
        };
        m.calc_profile();
        m
    }

    /// Lower the velocity and acceleration ceilings; the profile is
    /// recomputed. Used by the kinematics to slow moves with Z travel.
    pub fn limit_speed(&mut self, speed: f64, accel: f64) {
        self.max_cruise_v = self.max_cruise_v.min(speed);
        self.accel = self.accel.min(accel);
        self.calc_profile();
    }

    /// True when no axis moves at all.
    pub fn is_motionless(&self) -> bool {
        self.axes_d.iter().all(|d| *d == 0.)
    }

    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }

    fn calc_profile(&mut self) {
        if self.move_d <= 0. || self.accel <= 0. {
            self.cruise_v = self.max_cruise_v;
            self.accel_t = 0.;
            self.cruise_t = 0.;
            self.decel_t = 0.;
            self.accel_r = 0.;
            self.cruise_r = 0.;
            self.decel_r = 0.;
            return;
        }
        // Short moves never reach the requested speed; clamp the cruise
        // velocity to what a full accelerate-then-decelerate can hit.
        let cruise_v = self.max_cruise_v.min((self.accel * self.move_d).sqrt());
        let accel_t = cruise_v / self.accel;
        let accel_d = 0.5 * cruise_v * accel_t;
        let cruise_d = (self.move_d - 2. * accel_d).max(0.);
        self.cruise_v = cruise_v;
        self.accel_t = accel_t;
        self.cruise_t = cruise_d / cruise_v;
        self.decel_t = accel_t;
        self.accel_r = accel_d / self.move_d;
        self.cruise_r = cruise_d / self.move_d;
        self.decel_r = accel_d / self.move_d;
    }
}
