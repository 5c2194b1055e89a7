//! Hardware abstraction traits for the boat's actuators and sensors.
//!
//! The control loop and reporter talk to hardware only through these
//! traits, so the same code drives real rudder servos and GPS receivers
//! or the mocks from [`crate::hal::mock`].
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Actuator`] | Motor throttle and rudder output |
//! | [`PositionSource`] | GPS fix input |
//! | [`SystemSensors`] | Battery, temperature, and host metrics |
//!
//! # Example
//!
//! ```rust
//! use helmlink::traits::Actuator;
//! use helmlink::hal::MockActuator;
//!
//! let mut actuator = MockActuator::new();
//! actuator.set_throttle(25.0).unwrap();
//! actuator.set_rudder(-10.0).unwrap();
//! actuator.stop().unwrap();
//! assert_eq!(actuator.throttle(), 0.0);
//! ```

use crate::telemetry::{GpsFix, SystemMetrics};

/// Motor and rudder output.
///
/// # Implementation Notes
///
/// - Throttle is percent, 0 to 100. Implementations should clamp.
/// - Rudder is degrees, positive to starboard. The safety gate has
///   already bounded the value; clamping again is harmless.
pub trait Actuator {
    /// Error type for actuator operations.
    type Error;

    /// Set motor throttle in percent.
    fn set_throttle(&mut self, percent: f64) -> Result<(), Self::Error>;

    /// Set rudder angle in degrees.
    fn set_rudder(&mut self, angle: f64) -> Result<(), Self::Error>;

    /// Stop the motors and center the rudder.
    fn stop(&mut self) -> Result<(), Self::Error> {
        self.set_throttle(0.0)?;
        self.set_rudder(0.0)
    }
}

/// GPS receiver input.
///
/// # Implementation Notes
///
/// - `poll_fix()` returns `Ok(None)` while the receiver has no fix;
///   the caller treats a long run of `None` as a GPS timeout.
/// - Fixes should carry the receiver's own timestamp when available.
pub trait PositionSource {
    /// Error type for receiver operations.
    type Error;

    /// The latest fix, if the receiver has one.
    fn poll_fix(&mut self) -> Result<Option<GpsFix>, Self::Error>;
}

/// Battery, temperature, and host metrics.
///
/// Returns `Ok(None)` when a platform has no sensor pack; the safety
/// monitor then skips the battery and temperature checks.
pub trait SystemSensors {
    /// Error type for sensor operations.
    type Error;

    /// Read the current system metrics.
    fn read_metrics(&mut self) -> Result<Option<SystemMetrics>, Self::Error>;
}

/// Wall-clock source.
///
/// The control loop and ledger take explicit timestamps so tests can
/// drive time; production code passes [`crate::hal::WallClock`].
pub trait Clock {
    /// The current time.
    fn now(&self) -> chrono::DateTime<chrono::Utc>;
}
