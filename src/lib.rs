//! # helmlink
//!
//! Command and telemetry engine for semi-autonomous boats over MQTT.
//!
//! ## Features
//!
//! - **Wire codec**: Versioned JSON command envelopes with strict validation
//! - **Command lifecycle**: Dedup, monotonic state machine, timeout and
//!   retention sweeps
//! - **Dispatch**: Priority ordering, navigation supersession, emergency
//!   preemption
//! - **Navigation**: Waypoint, course, and hold goals with PID heading control
//! - **Safety**: Geofence, speed, battery, temperature, and GPS-loss gating
//!   between navigation and the actuators
//! - **Ground side**: Fleet registry and command tracking over wildcard
//!   subscriptions
//!
//! ## Architecture
//!
//! The crate is structured so everything above the broker can be tested on a
//! desk without a boat:
//!
//! - `envelope` - wire formats and topic layout
//! - `commands` / `ledger` - lifecycle, priority, dedup
//! - `dispatch` - admits and executes commands, one instance per boat
//! - `nav` / `safety` - goal execution and the actuator gate
//! - `traits` / `hal` - hardware and persistence seams, mock implementations
//! - `services` - broker session, control loop, reporter, ground station
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use tokio::sync::mpsc;
//! use helmlink::{
//!     BoatConfig, CommandDispatcher, CommandEnvelope, CommandPayload,
//!     ControlAction, SharedBoatState,
//! };
//!
//! let state = Arc::new(SharedBoatState::new());
//! let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
//! let mut dispatcher = CommandDispatcher::new(&BoatConfig::new("boat-01"), state, ack_tx);
//!
//! let env = CommandEnvelope::new(
//!     "boat-01",
//!     CommandPayload::Control(ControlAction::SetThrottle {
//!         speed: 40.0,
//!         ramp_time: 5.0,
//!     }),
//! );
//!
//! let now = Utc::now();
//! dispatcher.submit(env, now);
//! dispatcher.process_next(now);
//! ```

#![warn(missing_docs)]

/// Command lifecycle states, priority ordering, and the backlog queue.
pub mod commands;
/// Boat and ground configuration with floors on the dangerous knobs.
pub mod config;
/// Command admission, execution, and the per-tick control pipeline.
pub mod dispatch;
/// Wire formats: command envelopes, telemetry messages, topic layout.
pub mod envelope;
/// Great-circle geometry helpers.
pub mod geo;
/// Mock hardware and persistence implementations for testing.
pub mod hal;
/// Command ledger: dedup, lifecycle transitions, timeout and retention sweeps.
pub mod ledger;
/// Navigation controller: goals, mode machine, PID heading control.
pub mod nav;
/// Ground-side fleet registry and command tracking.
pub mod registry;
/// Safety limits and the monitor gating every actuator write.
pub mod safety;
/// Broker sessions, control loop, and telemetry reporter tasks.
pub mod services;
/// Telemetry types and the shared boat state.
pub mod telemetry;
/// Hardware and persistence seams.
pub mod traits;

// Re-exports for convenience
pub use commands::{CommandQueue, CommandState, FailReason, Priority, QueuedCommand};
pub use config::{BoatConfig, GroundConfig, MqttConfig, ReportIntervals};
pub use dispatch::{
    CommandDispatcher, ControlTickOutput, DispatchError, DispatchOutcome, ProcessedCommand,
    Submission,
};
pub use envelope::{
    AckMessage, CodecError, CommandEnvelope, CommandKind, CommandPayload, ConfigAction,
    ControlAction, EmergencyAction, GpsMessage, HeartbeatMessage, LogMessage, NavigationAction,
    ReportIntervalsPatch, StatusAction, StatusMessage, TelemetryKind,
};
pub use ledger::{Admission, CommandLedger, LedgerEntry, LedgerError};
pub use nav::{NavError, NavEvent, NavGoal, NavIntent, NavMode, NavOutput, NavigationController};
pub use registry::{BoatEntry, BoatHealth, BoatRegistry, CommandTracker};
pub use safety::{
    Gate, SafetyLimits, SafetyLimitsPatch, SafetyMonitor, Setpoints, Violation, ViolationClass,
};
pub use services::{
    BoatSession, ControlRunner, GroundHandle, GroundSession, OutboundMessage, TelemetryReporter,
};
pub use telemetry::{
    GpsFix, MotorState, NavStatus, Position, SharedBoatState, StatusData, SystemMetrics,
    TelemetrySnapshot,
};
pub use traits::{Actuator, Clock, Persistence, PositionSource, SystemSensors};
