//! Trait definitions for the hardware seam.
//!
//! The control loop and reporter are written against these traits so the
//! same code runs on a real boat or against the mocks in [`crate::hal`].
//!
//! # Hardware Abstraction
//!
//! - [`Actuator`]: motor throttle and rudder output
//! - [`PositionSource`]: GPS fix input
//! - [`SystemSensors`]: battery, temperature, and host metrics
//! - [`Clock`]: wall-clock source for deterministic tests
//! - [`Persistence`]: sink for finished commands and telemetry

pub mod hardware;
pub mod persistence;

pub use hardware::*;
pub use persistence::*;
