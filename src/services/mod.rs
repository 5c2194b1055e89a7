//! Long-running tasks that tie the engine to the broker and the hardware.
//!
//! A boat daemon runs three of these against one [`SharedBoatState`] and one
//! dispatcher:
//! - [`mqtt::BoatSession`] owns the broker connection, decoding inbound
//!   commands and publishing everything handed to its outbound channel
//! - [`runner::ControlRunner`] drains commands into the dispatcher and drives
//!   the once-a-second control tick against the actuators
//! - [`reporter::TelemetryReporter`] publishes status, GPS, heartbeat, and
//!   system telemetry on their configured periods
//!
//! The ground station runs [`ground::GroundSession`] instead, which feeds a
//! fleet registry and command tracker from the wildcard telemetry topics.
//!
//! All broker traffic flows through channels, so the control loop and the
//! reporter never block on the network.
//!
//! [`SharedBoatState`]: crate::telemetry::SharedBoatState

pub mod ground;
pub mod mqtt;
pub mod reporter;
pub mod runner;

pub use ground::{GroundHandle, GroundSession};
pub use mqtt::{BoatSession, OutboundMessage, TransportError};
pub use reporter::TelemetryReporter;
pub use runner::ControlRunner;
