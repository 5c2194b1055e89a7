//! Navigation controller: mode state machine and heading PID.
//!
//! The controller holds at most one active [`NavIntent`]. Installing a new
//! intent atomically replaces the previous one, which the dispatcher then
//! fails as superseded. Each call to [`NavigationController::tick`] turns the
//! latest GPS fix into throttle and rudder setpoints; the setpoints go to the
//! safety gate, never straight to an actuator.
//!
//! Mode transitions:
//!
//! ```text
//! Idle <-> NavigatingToWaypoint | HoldingCourse | HoldingPosition
//!   any --emergency/safety stop--> EmergencyStopped --resume--> Idle
//! ```
//!
//! `EmergencyStopped` is latched: only an authenticated resume leaves it,
//! and installing intents while latched is refused.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::geo;
use crate::safety::Setpoints;
use crate::telemetry::GpsFix;

/// Control loop period in seconds.
pub const TICK_SECONDS: f64 = 1.0;

/// Maximum commanded rudder swing in degrees per second.
const MAX_TURN_RATE_DEG_S: f64 = 30.0;

/// Speed cap for hold-position correction bursts, in percent.
const HOLD_RETURN_SPEED_MAX: f64 = 30.0;

// ============================================================================
// Modes and Intents
// ============================================================================

/// What the navigation controller is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavMode {
    /// No active goal; setpoints neutral.
    Idle,
    /// Steering toward a waypoint.
    NavigatingToWaypoint,
    /// Holding a fixed heading for a duration.
    HoldingCourse,
    /// Station keeping around a hold point.
    HoldingPosition,
    /// Latched stop. Exits only via authenticated resume.
    EmergencyStopped,
}

/// A navigation goal.
#[derive(Clone, Debug, PartialEq)]
pub enum NavGoal {
    /// Steer to a coordinate and complete inside the arrival radius.
    Waypoint {
        /// Target latitude in degrees.
        latitude: f64,
        /// Target longitude in degrees.
        longitude: f64,
        /// Throttle while underway, in percent.
        max_speed: f64,
        /// Completion radius in meters.
        arrival_radius: f64,
    },
    /// Hold a heading and speed for a duration.
    Course {
        /// Heading in degrees.
        heading: f64,
        /// Throttle in percent.
        speed: f64,
        /// Seconds to hold the course.
        duration: u64,
    },
    /// Stay near the position the boat was at when the goal was installed.
    Hold {
        /// Allowed drift in meters.
        max_drift: f64,
    },
}

/// A goal bound to the command that requested it.
#[derive(Clone, Debug, PartialEq)]
pub struct NavIntent {
    /// The requesting command, failed as superseded if replaced.
    pub command_id: Uuid,
    /// What to do.
    pub goal: NavGoal,
}

/// Event produced by a tick when the active goal finishes.
#[derive(Clone, Debug, PartialEq)]
pub enum NavEvent {
    /// The active goal completed; its command should be marked completed.
    Completed {
        /// The finished command.
        command_id: Uuid,
    },
}

/// One tick's worth of output.
#[derive(Clone, Debug, PartialEq)]
pub struct NavOutput {
    /// Demanded setpoints, pre safety gate.
    pub setpoints: Setpoints,
    /// Goal completion, if any.
    pub event: Option<NavEvent>,
}

impl NavOutput {
    fn neutral() -> Self {
        Self {
            setpoints: Setpoints::neutral(),
            event: None,
        }
    }
}

/// Errors installing a navigation intent.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NavError {
    /// Hold-position needs a current fix to anchor the hold point.
    #[error("no GPS position available")]
    NoPosition,
    /// The controller is latched in the emergency-stopped mode.
    #[error("emergency stopped; resume required")]
    EmergencyStopped,
}

// ============================================================================
// Heading PID
// ============================================================================

/// PID loop turning heading error into a rudder angle.
///
/// Output and integral are both clamped to the rudder excursion limit, so
/// the integral cannot wind up past what the rudder can express.
#[derive(Clone, Debug)]
pub struct HeadingPid {
    kp: f64,
    ki: f64,
    kd: f64,
    max_output: f64,
    integral: f64,
    last_error: Option<f64>,
}

impl Default for HeadingPid {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.1,
            kd: 0.5,
            max_output: 45.0,
            integral: 0.0,
            last_error: None,
        }
    }
}

impl HeadingPid {
    /// Advance the loop by `dt` seconds with the given heading error.
    pub fn update(&mut self, error: f64, dt: f64) -> f64 {
        if dt <= 0.0 {
            return 0.0;
        }

        let p_term = self.kp * error;

        self.integral += error * dt;
        self.integral = self.integral.clamp(-self.max_output, self.max_output);
        let i_term = self.ki * self.integral;

        let d_term = match self.last_error {
            Some(last) => self.kd * (error - last) / dt,
            None => 0.0,
        };
        self.last_error = Some(error);

        (p_term + i_term + d_term).clamp(-self.max_output, self.max_output)
    }

    /// Clear accumulated state. Called on every intent change and stop.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Clone, Debug)]
struct ActiveIntent {
    intent: NavIntent,
    /// Seconds of tick time since installation, drives course duration.
    elapsed: f64,
    /// Anchor for hold-position drift, captured at installation.
    hold_point: Option<(f64, f64)>,
}

/// The navigation mode state machine.
pub struct NavigationController {
    mode: NavMode,
    active: Option<ActiveIntent>,
    pid: HeadingPid,
    last_rudder: f64,
}

impl Default for NavigationController {
    fn default() -> Self {
        Self::new()
    }
}

impl NavigationController {
    /// Create an idle controller.
    pub fn new() -> Self {
        Self {
            mode: NavMode::Idle,
            active: None,
            pid: HeadingPid::default(),
            last_rudder: 0.0,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> NavMode {
        self.mode
    }

    /// Command the controller is serving, if any.
    pub fn active_command(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.intent.command_id)
    }

    /// True while latched in the emergency-stopped mode.
    pub fn is_emergency_stopped(&self) -> bool {
        self.mode == NavMode::EmergencyStopped
    }

    /// Install a new intent, replacing any active one.
    ///
    /// Returns the command id of the replaced intent so the dispatcher can
    /// fail it as superseded. Refused while emergency stopped.
    pub fn install(
        &mut self,
        intent: NavIntent,
        current_fix: Option<&GpsFix>,
    ) -> Result<Option<Uuid>, NavError> {
        if self.is_emergency_stopped() {
            return Err(NavError::EmergencyStopped);
        }

        let hold_point = match &intent.goal {
            NavGoal::Hold { .. } => {
                let fix = current_fix.ok_or(NavError::NoPosition)?;
                Some((fix.latitude, fix.longitude))
            }
            _ => None,
        };

        let superseded = self.active.take().map(|a| a.intent.command_id);

        self.mode = match &intent.goal {
            NavGoal::Waypoint { .. } => NavMode::NavigatingToWaypoint,
            NavGoal::Course { .. } => NavMode::HoldingCourse,
            NavGoal::Hold { .. } => NavMode::HoldingPosition,
        };
        info!(command_id = %intent.command_id, mode = ?self.mode, "navigation goal installed");

        self.active = Some(ActiveIntent {
            intent,
            elapsed: 0.0,
            hold_point,
        });
        self.pid.reset();
        self.last_rudder = 0.0;

        Ok(superseded)
    }

    /// Cancel the active goal and return to idle.
    ///
    /// Returns the cancelled command id. Does not touch the emergency latch.
    pub fn stop_navigation(&mut self) -> Option<Uuid> {
        let cancelled = self.active.take().map(|a| a.intent.command_id);
        if self.mode != NavMode::EmergencyStopped {
            self.mode = NavMode::Idle;
        }
        self.pid.reset();
        self.last_rudder = 0.0;
        cancelled
    }

    /// Latch the emergency-stopped mode, cancelling any active goal.
    ///
    /// Idempotent. Returns the preempted command id, if there was one.
    pub fn emergency_stop(&mut self) -> Option<Uuid> {
        let preempted = self.active.take().map(|a| a.intent.command_id);
        self.mode = NavMode::EmergencyStopped;
        self.pid.reset();
        self.last_rudder = 0.0;
        preempted
    }

    /// Leave the emergency-stopped mode. Returns false when not latched.
    ///
    /// The caller is responsible for authentication; this only flips state.
    pub fn resume(&mut self) -> bool {
        if self.mode != NavMode::EmergencyStopped {
            return false;
        }
        self.mode = NavMode::Idle;
        info!("resumed from emergency stop");
        true
    }

    /// Advance one control tick.
    ///
    /// `dt` is the seconds since the previous tick. Without a fix the tick
    /// produces neutral setpoints and no progress is attributed to timed
    /// goals' steering, though course time still elapses.
    pub fn tick(&mut self, fix: Option<&GpsFix>, dt: f64) -> NavOutput {
        if self.mode == NavMode::EmergencyStopped || self.mode == NavMode::Idle {
            return NavOutput::neutral();
        }

        let (goal, elapsed, hold_point) = {
            let Some(active) = self.active.as_mut() else {
                return NavOutput::neutral();
            };
            active.elapsed += dt;
            (active.intent.goal.clone(), active.elapsed, active.hold_point)
        };

        // Course completion is time-based and does not need a fix.
        if let NavGoal::Course { duration, .. } = &goal {
            if elapsed >= *duration as f64 {
                return self.complete_active();
            }
        }

        let Some(fix) = fix else {
            debug!("no GPS fix, skipping steering this tick");
            return NavOutput::neutral();
        };

        let (target_heading, throttle) = match goal {
            NavGoal::Waypoint {
                latitude,
                longitude,
                max_speed,
                arrival_radius,
            } => {
                let distance =
                    geo::haversine_distance(fix.latitude, fix.longitude, latitude, longitude);
                if distance <= arrival_radius {
                    info!(distance_m = distance, "waypoint reached");
                    return self.complete_active();
                }
                let bearing =
                    geo::initial_bearing(fix.latitude, fix.longitude, latitude, longitude);
                (bearing, max_speed)
            }
            NavGoal::Course { heading, speed, .. } => (heading, speed),
            NavGoal::Hold { max_drift } => {
                let (hold_lat, hold_lon) =
                    hold_point.expect("hold intent always has a hold point");
                let drift =
                    geo::haversine_distance(fix.latitude, fix.longitude, hold_lat, hold_lon);
                if drift <= max_drift {
                    // Inside tolerance: idle, keep the PID history for the
                    // next correction burst.
                    self.last_rudder = 0.0;
                    return NavOutput::neutral();
                }
                let bearing =
                    geo::initial_bearing(fix.latitude, fix.longitude, hold_lat, hold_lon);
                let return_speed = (drift * 2.0).min(HOLD_RETURN_SPEED_MAX);
                (bearing, return_speed)
            }
        };

        let error = geo::heading_error(fix.heading, target_heading);
        let raw_rudder = self.pid.update(error, dt);

        // Honor the turn rate limit by slewing from the last commanded angle.
        let max_swing = MAX_TURN_RATE_DEG_S * dt;
        let rudder = raw_rudder.clamp(self.last_rudder - max_swing, self.last_rudder + max_swing);
        self.last_rudder = rudder;

        NavOutput {
            setpoints: Setpoints {
                throttle_percent: throttle,
                rudder_angle: rudder,
            },
            event: None,
        }
    }

    fn complete_active(&mut self) -> NavOutput {
        let command_id = self
            .active
            .take()
            .map(|a| a.intent.command_id)
            .expect("complete_active called with an active intent");
        self.mode = NavMode::Idle;
        self.pid.reset();
        self.last_rudder = 0.0;
        NavOutput {
            setpoints: Setpoints::neutral(),
            event: Some(NavEvent::Completed { command_id }),
        }
    }
}
