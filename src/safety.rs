//! Safety monitor: the invariant table and the per-tick gate.
//!
//! Every control tick runs [`SafetyMonitor::assess`] on the current telemetry
//! and the controller's demanded setpoints before anything reaches an
//! actuator. The monitor's verdict is final: a clamp rewrites the demand, a
//! stop forces the boat into the emergency-stopped mode regardless of what
//! any controller wanted.
//!
//! Violations split into two classes. Speed and rudder demands are clamped
//! and execution continues. Battery, temperature, geofence, and GPS-timeout
//! violations stop the boat outright.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::geo;
use crate::telemetry::TelemetrySnapshot;

// ============================================================================
// Limits
// ============================================================================

/// The active safety invariant table.
///
/// Immutable between config swaps: a config command builds a whole new table
/// with [`SafetyLimitsPatch::apply_to`] and swaps it in, so a tick never sees
/// a half-updated table.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Throttle ceiling in percent.
    pub max_speed_percent: f64,
    /// Rudder excursion limit in degrees, either side.
    pub max_rudder_angle: f64,
    /// Geofence radius around the start position, in meters.
    pub max_distance_from_start_m: f64,
    /// Minimum battery voltage before a forced stop.
    pub battery_voltage_min: f64,
    /// Maximum controller temperature in Celsius.
    pub temperature_max_c: f64,
    /// Seconds without a GPS fix before a forced stop.
    pub gps_timeout_seconds: u64,
    /// Seconds without any inbound command before the condition is reported.
    pub command_timeout_seconds: u64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_speed_percent: 70.0,
            max_rudder_angle: 45.0,
            max_distance_from_start_m: 1000.0,
            battery_voltage_min: 11.0,
            temperature_max_c: 85.0,
            gps_timeout_seconds: 30,
            command_timeout_seconds: 60,
        }
    }
}

/// Partial update of the safety limit table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimitsPatch {
    /// New throttle ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_speed_percent: Option<f64>,
    /// New rudder limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rudder_angle: Option<f64>,
    /// New geofence radius.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_distance_from_start_m: Option<f64>,
    /// New battery floor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_voltage_min: Option<f64>,
    /// New temperature ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_max_c: Option<f64>,
    /// New GPS staleness limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_timeout_seconds: Option<u64>,
    /// New command silence limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_seconds: Option<u64>,
}

impl SafetyLimitsPatch {
    /// Build a new table from `base` with this patch applied.
    pub fn apply_to(&self, base: &SafetyLimits) -> SafetyLimits {
        SafetyLimits {
            max_speed_percent: self.max_speed_percent.unwrap_or(base.max_speed_percent),
            max_rudder_angle: self.max_rudder_angle.unwrap_or(base.max_rudder_angle),
            max_distance_from_start_m: self
                .max_distance_from_start_m
                .unwrap_or(base.max_distance_from_start_m),
            battery_voltage_min: self.battery_voltage_min.unwrap_or(base.battery_voltage_min),
            temperature_max_c: self.temperature_max_c.unwrap_or(base.temperature_max_c),
            gps_timeout_seconds: self.gps_timeout_seconds.unwrap_or(base.gps_timeout_seconds),
            command_timeout_seconds: self
                .command_timeout_seconds
                .unwrap_or(base.command_timeout_seconds),
        }
    }
}

// ============================================================================
// Violations
// ============================================================================

/// What kind of limit was broken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationClass {
    /// Throttle demand above the ceiling. Clamp only.
    Speed,
    /// Rudder demand beyond the excursion limit. Clamp only.
    RudderAngle,
    /// Boat outside the geofence radius. Forces a stop.
    Geofence,
    /// Battery below the floor. Forces a stop.
    Battery,
    /// Controller over temperature. Forces a stop.
    Temperature,
    /// No GPS fix within the staleness limit. Forces a stop.
    GpsTimeout,
    /// No inbound command within the silence limit. Reported only.
    CommandTimeout,
}

impl ViolationClass {
    /// True when this class forces the emergency-stopped mode.
    pub const fn forces_stop(&self) -> bool {
        matches!(
            self,
            ViolationClass::Geofence
                | ViolationClass::Battery
                | ViolationClass::Temperature
                | ViolationClass::GpsTimeout
        )
    }
}

/// A recorded limit violation.
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    /// Which limit was broken.
    pub class: ViolationClass,
    /// Human-readable detail for logs and acks.
    pub detail: String,
}

impl Violation {
    fn new(class: ViolationClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Actuator demands for one control tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Setpoints {
    /// Demanded throttle in percent.
    pub throttle_percent: f64,
    /// Demanded rudder angle in degrees.
    pub rudder_angle: f64,
}

impl Setpoints {
    /// Neutral demands: throttle idle, rudder centered.
    pub const fn neutral() -> Self {
        Self {
            throttle_percent: 0.0,
            rudder_angle: 0.0,
        }
    }
}

/// Verdict of the safety gate for one tick.
#[derive(Clone, Debug, PartialEq)]
pub enum Gate {
    /// Demands are within limits; apply as demanded.
    Pass(Setpoints),
    /// One or both demands were out of range and have been clamped.
    Clamped {
        /// The demands after clamping.
        setpoints: Setpoints,
        /// What was clamped and why.
        violations: Vec<Violation>,
    },
    /// A stop-class limit is broken. The boat must emergency stop.
    Stop(Violation),
}

impl Gate {
    /// The setpoints to actually apply this tick.
    pub fn setpoints(&self) -> Setpoints {
        match self {
            Gate::Pass(sp) => *sp,
            Gate::Clamped { setpoints, .. } => *setpoints,
            Gate::Stop(_) => Setpoints::neutral(),
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Evaluates the invariant table against telemetry every tick.
pub struct SafetyMonitor {
    limits: SafetyLimits,
    violation_counts: HashMap<ViolationClass, u64>,
    last_command_at: Option<Instant>,
    command_silence_reported: bool,
}

impl Default for SafetyMonitor {
    fn default() -> Self {
        Self::new(SafetyLimits::default())
    }
}

impl SafetyMonitor {
    /// Create a monitor with the given limit table.
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            violation_counts: HashMap::new(),
            last_command_at: None,
            command_silence_reported: false,
        }
    }

    /// The active limit table.
    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Swap in a new limit table, effective immediately.
    pub fn swap_limits(&mut self, limits: SafetyLimits) {
        self.limits = limits;
    }

    /// Times a limit class has been violated since startup.
    pub fn violation_count(&self, class: ViolationClass) -> u64 {
        self.violation_counts.get(&class).copied().unwrap_or(0)
    }

    /// Record that a command arrived, resetting the silence watchdog.
    pub fn note_command(&mut self) {
        self.last_command_at = Some(Instant::now());
        self.command_silence_reported = false;
    }

    /// Evaluate the limit table against telemetry and the demanded setpoints.
    ///
    /// Stop-class checks run first; the first one broken decides the tick.
    /// Otherwise speed and rudder demands are clamped into range. Command
    /// silence is checked as a side channel and never affects the gate.
    pub fn assess(&mut self, sample: &TelemetrySnapshot, demanded: Setpoints) -> Gate {
        self.check_command_silence();

        if let Some(violation) = self.check_stop_conditions(sample) {
            self.count(violation.class);
            error!(
                class = ?violation.class,
                detail = %violation.detail,
                "safety stop"
            );
            return Gate::Stop(violation);
        }

        let mut setpoints = demanded;
        let mut violations = Vec::new();

        if demanded.throttle_percent > self.limits.max_speed_percent {
            setpoints.throttle_percent = self.limits.max_speed_percent;
            violations.push(Violation::new(
                ViolationClass::Speed,
                format!(
                    "throttle {:.1}% clamped to {:.1}%",
                    demanded.throttle_percent, self.limits.max_speed_percent
                ),
            ));
        }
        if demanded.rudder_angle.abs() > self.limits.max_rudder_angle {
            setpoints.rudder_angle = demanded
                .rudder_angle
                .clamp(-self.limits.max_rudder_angle, self.limits.max_rudder_angle);
            violations.push(Violation::new(
                ViolationClass::RudderAngle,
                format!(
                    "rudder {:.1} deg clamped to {:.1} deg",
                    demanded.rudder_angle, setpoints.rudder_angle
                ),
            ));
        }

        if violations.is_empty() {
            Gate::Pass(setpoints)
        } else {
            for v in &violations {
                self.count(v.class);
                warn!(class = ?v.class, detail = %v.detail, "safety clamp");
            }
            Gate::Clamped {
                setpoints,
                violations,
            }
        }
    }

    fn check_stop_conditions(&self, sample: &TelemetrySnapshot) -> Option<Violation> {
        // Zero readings mean the sensor has not reported yet.
        let battery = sample.system.battery_voltage;
        if battery > 0.0 && battery < self.limits.battery_voltage_min {
            return Some(Violation::new(
                ViolationClass::Battery,
                format!(
                    "battery {:.2} V below minimum {:.2} V",
                    battery, self.limits.battery_voltage_min
                ),
            ));
        }

        let temperature = sample.system.temperature_c;
        if temperature > 0.0 && temperature > self.limits.temperature_max_c {
            return Some(Violation::new(
                ViolationClass::Temperature,
                format!(
                    "temperature {:.1} C above maximum {:.1} C",
                    temperature, self.limits.temperature_max_c
                ),
            ));
        }

        if let (Some(fix), Some(start)) = (&sample.fix, &sample.start_position) {
            let distance = geo::haversine_distance(
                start.latitude,
                start.longitude,
                fix.latitude,
                fix.longitude,
            );
            if distance > self.limits.max_distance_from_start_m {
                return Some(Violation::new(
                    ViolationClass::Geofence,
                    format!(
                        "{:.0} m from start exceeds geofence of {:.0} m",
                        distance, self.limits.max_distance_from_start_m
                    ),
                ));
            }
        }

        if let Some(age) = sample.fix_age_seconds {
            if age > self.limits.gps_timeout_seconds as f64 {
                return Some(Violation::new(
                    ViolationClass::GpsTimeout,
                    format!(
                        "no GPS fix for {:.0} s, limit {} s",
                        age, self.limits.gps_timeout_seconds
                    ),
                ));
            }
        }

        None
    }

    fn check_command_silence(&mut self) {
        let Some(last) = self.last_command_at else {
            return;
        };
        let silence = last.elapsed().as_secs();
        if silence > self.limits.command_timeout_seconds && !self.command_silence_reported {
            self.command_silence_reported = true;
            self.count(ViolationClass::CommandTimeout);
            warn!(silence_seconds = silence, "no commands received");
        }
    }

    fn count(&mut self, class: ViolationClass) {
        *self.violation_counts.entry(class).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav::NavMode;
    use crate::telemetry::{GpsFix, MotorState, Position, SystemMetrics};
    use chrono::Utc;

    fn sample() -> TelemetrySnapshot {
        TelemetrySnapshot {
            fix: Some(GpsFix {
                latitude: 52.0,
                longitude: 4.0,
                heading: 90.0,
                speed_knots: 2.0,
                satellites: Some(8),
                fix_time: Utc::now(),
            }),
            fix_age_seconds: Some(1.0),
            motors: MotorState::default(),
            system: SystemMetrics {
                cpu_percent: 20.0,
                memory_percent: 30.0,
                temperature_c: 45.0,
                battery_voltage: 12.6,
            },
            nav_mode: NavMode::Idle,
            active_command: None,
            start_position: Some(Position {
                latitude: 52.0,
                longitude: 4.0,
            }),
            uptime_seconds: 100.0,
        }
    }

    #[test]
    fn in_range_demands_pass() {
        let mut monitor = SafetyMonitor::default();
        let gate = monitor.assess(
            &sample(),
            Setpoints {
                throttle_percent: 50.0,
                rudder_angle: 20.0,
            },
        );
        assert!(matches!(gate, Gate::Pass(_)));
    }

    #[test]
    fn overspeed_is_clamped_not_stopped() {
        let mut monitor = SafetyMonitor::default();
        let gate = monitor.assess(
            &sample(),
            Setpoints {
                throttle_percent: 95.0,
                rudder_angle: 0.0,
            },
        );
        match gate {
            Gate::Clamped {
                setpoints,
                violations,
            } => {
                assert_eq!(setpoints.throttle_percent, 70.0);
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].class, ViolationClass::Speed);
            }
            other => panic!("expected clamp, got {:?}", other),
        }
        assert_eq!(monitor.violation_count(ViolationClass::Speed), 1);
    }

    #[test]
    fn rudder_clamped_symmetrically() {
        let mut monitor = SafetyMonitor::default();
        let gate = monitor.assess(
            &sample(),
            Setpoints {
                throttle_percent: 10.0,
                rudder_angle: -60.0,
            },
        );
        assert_eq!(gate.setpoints().rudder_angle, -45.0);
    }

    #[test]
    fn low_battery_forces_stop() {
        let mut monitor = SafetyMonitor::default();
        let mut s = sample();
        s.system.battery_voltage = 10.4;

        let gate = monitor.assess(&s, Setpoints::neutral());
        match gate {
            Gate::Stop(v) => assert_eq!(v.class, ViolationClass::Battery),
            other => panic!("expected stop, got {:?}", other),
        }
    }

    #[test]
    fn missing_battery_reading_does_not_stop() {
        let mut monitor = SafetyMonitor::default();
        let mut s = sample();
        s.system.battery_voltage = 0.0;

        let gate = monitor.assess(&s, Setpoints::neutral());
        assert!(matches!(gate, Gate::Pass(_)));
    }

    #[test]
    fn overtemperature_forces_stop() {
        let mut monitor = SafetyMonitor::default();
        let mut s = sample();
        s.system.temperature_c = 91.0;

        let gate = monitor.assess(&s, Setpoints::neutral());
        assert!(matches!(
            gate,
            Gate::Stop(Violation {
                class: ViolationClass::Temperature,
                ..
            })
        ));
    }

    #[test]
    fn geofence_breach_forces_stop() {
        let mut monitor = SafetyMonitor::default();
        let mut s = sample();
        // ~1.1 km north of start
        s.fix.as_mut().unwrap().latitude = 52.01;

        let gate = monitor.assess(&s, Setpoints::neutral());
        assert!(matches!(
            gate,
            Gate::Stop(Violation {
                class: ViolationClass::Geofence,
                ..
            })
        ));
    }

    #[test]
    fn stale_gps_forces_stop() {
        let mut monitor = SafetyMonitor::default();
        let mut s = sample();
        s.fix_age_seconds = Some(45.0);

        let gate = monitor.assess(&s, Setpoints::neutral());
        assert!(matches!(
            gate,
            Gate::Stop(Violation {
                class: ViolationClass::GpsTimeout,
                ..
            })
        ));
    }

    #[test]
    fn no_fix_ever_does_not_stop() {
        let mut monitor = SafetyMonitor::default();
        let mut s = sample();
        s.fix = None;
        s.fix_age_seconds = None;

        let gate = monitor.assess(&s, Setpoints::neutral());
        assert!(matches!(gate, Gate::Pass(_)));
    }

    #[test]
    fn stop_takes_priority_over_clamp() {
        let mut monitor = SafetyMonitor::default();
        let mut s = sample();
        s.system.battery_voltage = 9.0;

        let gate = monitor.assess(
            &s,
            Setpoints {
                throttle_percent: 99.0,
                rudder_angle: 80.0,
            },
        );
        assert!(matches!(gate, Gate::Stop(_)));
        assert_eq!(gate.setpoints(), Setpoints::neutral());
    }

    #[test]
    fn patch_builds_new_table() {
        let base = SafetyLimits::default();
        let patch = SafetyLimitsPatch {
            max_speed_percent: Some(50.0),
            gps_timeout_seconds: Some(60),
            ..Default::default()
        };

        let updated = patch.apply_to(&base);
        assert_eq!(updated.max_speed_percent, 50.0);
        assert_eq!(updated.gps_timeout_seconds, 60);
        // Untouched fields carry over
        assert_eq!(updated.max_rudder_angle, base.max_rudder_angle);
        assert_eq!(updated.battery_voltage_min, base.battery_voltage_min);
    }

    #[test]
    fn swapped_limits_take_effect_immediately() {
        let mut monitor = SafetyMonitor::default();
        let patch = SafetyLimitsPatch {
            max_speed_percent: Some(30.0),
            ..Default::default()
        };
        let new_limits = patch.apply_to(monitor.limits());
        monitor.swap_limits(new_limits);

        let gate = monitor.assess(
            &sample(),
            Setpoints {
                throttle_percent: 50.0,
                rudder_angle: 0.0,
            },
        );
        assert_eq!(gate.setpoints().throttle_percent, 30.0);
    }

    #[test]
    fn stop_classes_are_the_right_set() {
        assert!(!ViolationClass::Speed.forces_stop());
        assert!(!ViolationClass::RudderAngle.forces_stop());
        assert!(!ViolationClass::CommandTimeout.forces_stop());
        assert!(ViolationClass::Geofence.forces_stop());
        assert!(ViolationClass::Battery.forces_stop());
        assert!(ViolationClass::Temperature.forces_stop());
        assert!(ViolationClass::GpsTimeout.forces_stop());
    }
}
