//! Mock implementations for testing without hardware.
//!
//! Test doubles for the traits in [`crate::traits`], used by the unit and
//! integration tests and for running the daemon on a desk.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockActuator`] | [`Actuator`] | Records throttle and rudder calls |
//! | [`MockGps`] | [`PositionSource`] | Scripted sequence of fixes |
//! | [`MockSensors`] | [`SystemSensors`] | Fixed or scripted metrics |
//! | [`MockClock`] | [`Clock`] | Controllable time |
//! | [`MockPersistence`] | [`Persistence`] | In-memory record capture |
//!
//! [`WallClock`] also lives here: the production [`Clock`] backed by the
//! system time.
//!
//! [`Actuator`]: crate::traits::Actuator
//! [`PositionSource`]: crate::traits::PositionSource
//! [`SystemSensors`]: crate::traits::SystemSensors
//! [`Clock`]: crate::traits::Clock
//! [`Persistence`]: crate::traits::Persistence

use std::collections::VecDeque;

use chrono::Utc;

use crate::ledger::LedgerEntry;
use crate::telemetry::{GpsFix, StatusData, SystemMetrics};
use crate::traits::{Actuator, Clock, Persistence, PositionSource, SystemSensors};

// ============================================================================
// Actuator
// ============================================================================

/// Mock actuator that records every applied setpoint.
///
/// # Example
///
/// ```rust
/// use helmlink::hal::MockActuator;
/// use helmlink::traits::Actuator;
///
/// let mut actuator = MockActuator::new();
/// actuator.set_throttle(40.0).unwrap();
/// actuator.set_rudder(-5.0).unwrap();
///
/// assert_eq!(actuator.throttle(), 40.0);
/// assert_eq!(actuator.rudder(), -5.0);
/// assert_eq!(actuator.throttle_calls, 1);
/// ```
#[derive(Debug, Default)]
pub struct MockActuator {
    throttle: f64,
    rudder: f64,
    /// Number of `set_throttle` calls.
    pub throttle_calls: usize,
    /// Number of `set_rudder` calls.
    pub rudder_calls: usize,
    /// When set, every call fails.
    pub fail: bool,
}

impl MockActuator {
    /// New mock with everything at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last applied throttle in percent.
    pub fn throttle(&self) -> f64 {
        self.throttle
    }

    /// Last applied rudder angle in degrees.
    pub fn rudder(&self) -> f64 {
        self.rudder
    }
}

impl Actuator for MockActuator {
    type Error = &'static str;

    fn set_throttle(&mut self, percent: f64) -> Result<(), Self::Error> {
        if self.fail {
            return Err("actuator failure");
        }
        self.throttle = percent.clamp(0.0, 100.0);
        self.throttle_calls += 1;
        Ok(())
    }

    fn set_rudder(&mut self, angle: f64) -> Result<(), Self::Error> {
        if self.fail {
            return Err("actuator failure");
        }
        self.rudder = angle;
        self.rudder_calls += 1;
        Ok(())
    }
}

// ============================================================================
// GPS
// ============================================================================

/// Mock GPS receiver that replays a scripted sequence of fixes.
///
/// Each `poll_fix` pops the next scripted entry; once the script runs out
/// the last fix repeats. An empty script means no fix.
#[derive(Debug, Default)]
pub struct MockGps {
    script: VecDeque<Option<GpsFix>>,
    last: Option<GpsFix>,
}

impl MockGps {
    /// New receiver with no fix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver that always reports a fix at the given coordinate.
    pub fn fixed_at(latitude: f64, longitude: f64) -> Self {
        let mut gps = Self::new();
        gps.push_fix(GpsFix {
            latitude,
            longitude,
            heading: 0.0,
            speed_knots: 0.0,
            satellites: Some(8),
            fix_time: Utc::now(),
        });
        gps
    }

    /// Queue a fix.
    pub fn push_fix(&mut self, fix: GpsFix) {
        self.script.push_back(Some(fix));
    }

    /// Queue a poll with no fix (signal loss).
    pub fn push_dropout(&mut self) {
        self.script.push_back(None);
    }
}

impl PositionSource for MockGps {
    type Error = &'static str;

    fn poll_fix(&mut self) -> Result<Option<GpsFix>, Self::Error> {
        match self.script.pop_front() {
            Some(Some(fix)) => {
                self.last = Some(fix);
                Ok(Some(fix))
            }
            Some(None) => Ok(None),
            None => Ok(self.last),
        }
    }
}

// ============================================================================
// Sensors
// ============================================================================

/// Mock sensor pack reporting fixed metrics.
#[derive(Debug)]
pub struct MockSensors {
    /// Metrics returned by every read. `None` simulates a missing pack.
    pub metrics: Option<SystemMetrics>,
}

impl Default for MockSensors {
    fn default() -> Self {
        Self {
            metrics: Some(SystemMetrics {
                cpu_percent: 12.0,
                memory_percent: 30.0,
                temperature_c: 45.0,
                battery_voltage: 12.6,
            }),
        }
    }
}

impl MockSensors {
    /// Healthy sensor pack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sensor pack reporting the given battery voltage.
    pub fn with_battery(mut self, volts: f64) -> Self {
        if let Some(metrics) = &mut self.metrics {
            metrics.battery_voltage = volts;
        }
        self
    }
}

impl SystemSensors for MockSensors {
    type Error = &'static str;

    fn read_metrics(&mut self) -> Result<Option<SystemMetrics>, Self::Error> {
        Ok(self.metrics)
    }
}

// ============================================================================
// Clock
// ============================================================================

/// The real wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> chrono::DateTime<Utc> {
        Utc::now()
    }
}

/// Controllable clock for tests.
///
/// Starts at a fixed instant and only moves when advanced.
#[derive(Clone, Debug)]
pub struct MockClock {
    now: std::cell::Cell<chrono::DateTime<Utc>>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    /// Clock frozen at the current wall time.
    pub fn new() -> Self {
        Self {
            now: std::cell::Cell::new(Utc::now()),
        }
    }

    /// Move time forward.
    pub fn advance(&self, seconds: i64) {
        self.now
            .set(self.now.get() + chrono::Duration::seconds(seconds));
    }
}

impl Clock for MockClock {
    fn now(&self) -> chrono::DateTime<Utc> {
        self.now.get()
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Mock persistence that keeps everything in memory for assertions.
#[derive(Debug, Default)]
pub struct MockPersistence {
    /// Recorded terminal command entries.
    pub commands: Vec<LedgerEntry>,
    /// Recorded telemetry, by boat.
    pub telemetry: Vec<(String, StatusData)>,
}

impl MockPersistence {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MockPersistence {
    type Error = &'static str;

    fn record_command(&mut self, entry: &LedgerEntry) -> Result<(), Self::Error> {
        self.commands.push(entry.clone());
        Ok(())
    }

    fn record_telemetry(&mut self, boat_id: &str, data: &StatusData) -> Result<(), Self::Error> {
        self.telemetry.push((boat_id.to_string(), data.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actuator_records_and_clamps() {
        let mut actuator = MockActuator::new();
        actuator.set_throttle(150.0).unwrap();
        assert_eq!(actuator.throttle(), 100.0);
        assert_eq!(actuator.throttle_calls, 1);
    }

    #[test]
    fn actuator_failure_injection() {
        let mut actuator = MockActuator::new();
        actuator.fail = true;
        assert!(actuator.set_throttle(10.0).is_err());
        assert!(actuator.stop().is_err());
    }

    #[test]
    fn gps_replays_script_then_repeats_last() {
        let mut gps = MockGps::fixed_at(37.0, -122.0);
        let first = gps.poll_fix().unwrap().unwrap();
        assert_eq!(first.latitude, 37.0);

        // Script exhausted; the last fix repeats.
        let again = gps.poll_fix().unwrap().unwrap();
        assert_eq!(again.longitude, -122.0);
    }

    #[test]
    fn gps_dropout() {
        let mut gps = MockGps::new();
        gps.push_dropout();
        assert!(gps.poll_fix().unwrap().is_none());
        // No fix ever seen, so nothing to repeat.
        assert!(gps.poll_fix().unwrap().is_none());
    }

    #[test]
    fn sensors_report_battery() {
        let mut sensors = MockSensors::new().with_battery(11.5);
        let metrics = sensors.read_metrics().unwrap().unwrap();
        assert_eq!(metrics.battery_voltage, 11.5);
    }

    #[test]
    fn mock_clock_only_moves_when_advanced() {
        let clock = MockClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(30);
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }

    #[test]
    fn persistence_captures_telemetry() {
        let mut store = MockPersistence::new();
        store
            .record_telemetry("boat-1", &StatusData::default())
            .unwrap();
        assert_eq!(store.telemetry.len(), 1);
        assert_eq!(store.telemetry[0].0, "boat-1");
    }
}
