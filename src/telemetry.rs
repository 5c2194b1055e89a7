//! Telemetry snapshot types and the shared boat state.
//!
//! `SharedBoatState` is the one piece of mutable state every service touches:
//! the control loop writes setpoints and navigation mode, the GPS source
//! writes fixes, the reporter and status commands read snapshots. Readers
//! always get a copied-out snapshot, so nothing downstream ever holds the
//! lock while the control loop needs it.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::nav::NavMode;

// ============================================================================
// Snapshot Types
// ============================================================================

/// A latitude/longitude pair in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// A GPS fix as published on the gps topic.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Course over ground in degrees, 0 to 360.
    pub heading: f64,
    /// Speed over ground in knots.
    pub speed_knots: f64,
    /// Satellites used for the fix, when the receiver reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellites: Option<u8>,
    /// Receiver fix time.
    pub fix_time: DateTime<Utc>,
}

impl GpsFix {
    /// The position of this fix.
    pub fn position(&self) -> Position {
        Position {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Current actuator demands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorState {
    /// Throttle in percent, 0 to 100.
    pub throttle_percent: f64,
    /// Rudder angle in degrees, positive to starboard.
    pub rudder_angle: f64,
}

/// Host metrics published with heartbeats and the system report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// CPU load in percent.
    pub cpu_percent: f64,
    /// Memory usage in percent.
    pub memory_percent: f64,
    /// Controller temperature in Celsius.
    pub temperature_c: f64,
    /// Main battery voltage.
    pub battery_voltage: f64,
}

/// Navigation section of a status report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavStatus {
    /// Active navigation mode.
    pub mode: NavMode,
    /// Command the controller is working on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_command: Option<Uuid>,
}

/// Sectioned status report, shaped for the status topic and `get_status` acks.
///
/// Sections the requester filtered out are omitted from the JSON entirely.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusData {
    /// Latest GPS fix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsFix>,
    /// Actuator state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motors: Option<MotorState>,
    /// Navigation state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation: Option<NavStatus>,
    /// Host metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemMetrics>,
}

/// Point-in-time copy of the full boat state.
///
/// This is what the safety monitor and reporter consume; it never refers
/// back into the shared state.
#[derive(Clone, Debug)]
pub struct TelemetrySnapshot {
    /// Latest fix, if the receiver has produced one.
    pub fix: Option<GpsFix>,
    /// Seconds since the latest fix arrived.
    pub fix_age_seconds: Option<f64>,
    /// Actuator state.
    pub motors: MotorState,
    /// Host metrics.
    pub system: SystemMetrics,
    /// Navigation mode.
    pub nav_mode: NavMode,
    /// Command the navigation controller is executing.
    pub active_command: Option<Uuid>,
    /// Where the boat first acquired GPS, the geofence anchor.
    pub start_position: Option<Position>,
    /// Seconds since the boat process started.
    pub uptime_seconds: f64,
}

// ============================================================================
// Change Detection
// ============================================================================

/// GPS publish thresholds: a fix is worth publishing when the boat moved
/// more than a meter, changed speed by half a knot, or turned five degrees.
const GPS_MOVE_THRESHOLD_M: f64 = 1.0;
const GPS_SPEED_THRESHOLD: f64 = 0.5;
const GPS_HEADING_THRESHOLD: f64 = 5.0;
/// Publish regardless of movement at least this often.
const GPS_FORCE_PUBLISH_SECONDS: f64 = 30.0;

#[derive(Debug, Default)]
struct GpsChangeDetection {
    last_published: Option<GpsFix>,
    last_published_at: Option<Instant>,
}

// ============================================================================
// Shared Boat State
// ============================================================================

#[derive(Debug)]
struct BoatCore {
    fix: Option<GpsFix>,
    last_fix_at: Option<Instant>,
    motors: MotorState,
    system: SystemMetrics,
    nav_mode: NavMode,
    active_command: Option<Uuid>,
    start_position: Option<Position>,
}

/// Thread-safe boat state shared between the control loop, the transport
/// session, and the reporter tasks.
///
/// Uses `Mutex` rather than `RwLock`: the control loop writes every tick,
/// which makes writer starvation the thing to avoid. The GPS change
/// detection has its own lock so reporter publishes never contend with
/// control-loop writes.
pub struct SharedBoatState {
    core: Mutex<BoatCore>,
    start_time: Instant,
    gps_detection: Mutex<GpsChangeDetection>,
}

impl Default for SharedBoatState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedBoatState {
    /// Create fresh state. `start_time` becomes the uptime base for every
    /// service sharing this instance.
    pub fn new() -> Self {
        Self {
            core: Mutex::new(BoatCore {
                fix: None,
                last_fix_at: None,
                motors: MotorState::default(),
                system: SystemMetrics::default(),
                nav_mode: NavMode::Idle,
                active_command: None,
                start_position: None,
            }),
            start_time: Instant::now(),
            gps_detection: Mutex::new(GpsChangeDetection::default()),
        }
    }

    /// Seconds since this state was created.
    #[inline]
    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Record a new GPS fix. The first fix anchors the geofence.
    pub fn update_fix(&self, fix: GpsFix) {
        let mut core = self.core.lock().unwrap();
        if core.start_position.is_none() {
            core.start_position = Some(fix.position());
        }
        core.fix = Some(fix);
        core.last_fix_at = Some(Instant::now());
    }

    /// Record the actuator demands the control loop just applied.
    pub fn record_motors(&self, throttle_percent: f64, rudder_angle: f64) {
        let mut core = self.core.lock().unwrap();
        core.motors = MotorState {
            throttle_percent,
            rudder_angle,
        };
    }

    /// Record fresh host metrics.
    pub fn update_system(&self, system: SystemMetrics) {
        self.core.lock().unwrap().system = system;
    }

    /// Record the navigation mode and the command it is serving.
    pub fn set_nav(&self, mode: NavMode, active_command: Option<Uuid>) {
        let mut core = self.core.lock().unwrap();
        core.nav_mode = mode;
        core.active_command = active_command;
    }

    /// Copy out the full state.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let core = self.core.lock().unwrap();
        TelemetrySnapshot {
            fix: core.fix,
            fix_age_seconds: core.last_fix_at.map(|t| t.elapsed().as_secs_f64()),
            motors: core.motors,
            system: core.system,
            nav_mode: core.nav_mode,
            active_command: core.active_command,
            start_position: core.start_position,
            uptime_seconds: self.uptime_seconds(),
        }
    }

    /// Build a status report containing the requested sections.
    ///
    /// `include` of `None` means everything. Unknown section names are
    /// ignored.
    pub fn status_data(&self, include: Option<&[String]>) -> StatusData {
        let snapshot = self.snapshot();
        let wants = |section: &str| match include {
            None => true,
            Some(sections) => sections.iter().any(|s| s == section),
        };

        StatusData {
            gps: wants("gps").then_some(snapshot.fix).flatten(),
            motors: wants("motors").then_some(snapshot.motors),
            navigation: wants("navigation").then(|| NavStatus {
                mode: snapshot.nav_mode,
                active_command: snapshot.active_command,
            }),
            system: wants("system").then_some(snapshot.system),
        }
    }

    /// Return the latest fix when it is worth publishing.
    ///
    /// Worth publishing means it moved past the change thresholds since the
    /// last publish, or the force-publish window elapsed. Updates the
    /// detection baseline when it returns `Some`.
    pub fn check_gps_changes(&self) -> Option<GpsFix> {
        let fix = self.core.lock().unwrap().fix?;

        let mut detection = self.gps_detection.lock().unwrap();
        let significant = match (&detection.last_published, &detection.last_published_at) {
            (Some(last), Some(at)) => {
                let moved = crate::geo::haversine_distance(
                    last.latitude,
                    last.longitude,
                    fix.latitude,
                    fix.longitude,
                );
                moved > GPS_MOVE_THRESHOLD_M
                    || (fix.speed_knots - last.speed_knots).abs() > GPS_SPEED_THRESHOLD
                    || crate::geo::heading_error(last.heading, fix.heading).abs()
                        > GPS_HEADING_THRESHOLD
                    || at.elapsed().as_secs_f64() > GPS_FORCE_PUBLISH_SECONDS
            }
            _ => true,
        };

        if significant {
            detection.last_published = Some(fix);
            detection.last_published_at = Some(Instant::now());
            Some(fix)
        } else {
            None
        }
    }
}
