//! Command dispatcher: the single place inbound commands are admitted,
//! prioritized, executed, and acknowledged.
//!
//! The dispatcher owns the command ledger, the priority queue, the
//! navigation controller, and the safety monitor. Services hand it decoded
//! envelopes through [`CommandDispatcher::submit`] and drive execution with
//! [`CommandDispatcher::process_next`]; the control loop calls
//! [`CommandDispatcher::control_tick`] once a second to turn the active
//! goal into gated actuator setpoints.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::{CommandQueue, CommandState, FailReason};
use crate::config::{BoatConfig, ReportIntervals};
use crate::envelope::{
    AckMessage, CommandEnvelope, CommandPayload, ConfigAction, ControlAction, EmergencyAction,
    NavigationAction, StatusAction,
};
use crate::ledger::{Admission, CommandLedger, LedgerEntry};
use crate::nav::{NavEvent, NavGoal, NavIntent, NavMode, NavigationController};
use crate::safety::{Gate, SafetyMonitor, Setpoints, Violation};
use crate::telemetry::SharedBoatState;

// ============================================================================
// Outcomes
// ============================================================================

/// Result of offering an envelope to the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    /// Admitted and queued for execution.
    Queued,
    /// Already finished; re-acknowledged with its terminal state.
    DuplicateTerminal(CommandState),
    /// Already in flight; ignored.
    DuplicateInFlight(CommandState),
}

/// How a queued command was resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Ran to completion within this call.
    Completed,
    /// Accepted; finishes later through the control loop.
    InFlight,
    /// Refused and marked failed.
    Rejected(String),
}

/// A processed queue entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedCommand {
    /// The command that was executed.
    pub command_id: Uuid,
    /// How it went.
    pub outcome: DispatchOutcome,
}

/// Reasons a command is refused at dispatch time.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DispatchError {
    /// Direct control while a navigation goal is active.
    #[error("navigation goal active; direct control refused")]
    ModeConflict,
    /// Anything but resume while the emergency latch is set.
    #[error("emergency stopped; resume required")]
    EmergencyStopped,
    /// Bad or missing shared-secret token.
    #[error("authentication failed")]
    AuthRejected,
    /// Demand outside the active safety limits.
    #[error("{0}")]
    LimitExceeded(String),
    /// The command needs a GPS fix the boat does not have.
    #[error("no GPS position available")]
    NoPosition,
}

/// One control tick's result.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlTickOutput {
    /// Gated setpoints to apply to the actuators.
    pub setpoints: Setpoints,
    /// Set when a stop-class limit fired this tick.
    pub safety_stop: Option<Violation>,
}

// ============================================================================
// Manual Control Demand
// ============================================================================

/// Direct-control setpoints, held between control commands.
///
/// Throttle changes ramp at the rate implied by the command's `ramp_time`;
/// rudder changes apply immediately (the safety gate still clamps both).
#[derive(Clone, Copy, Debug, Default)]
struct ManualDemand {
    throttle_target: f64,
    throttle_current: f64,
    /// Percent per second. Zero means jump straight to the target.
    throttle_rate: f64,
    rudder: f64,
}

impl ManualDemand {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn tick(&mut self, dt: f64) -> Setpoints {
        if self.throttle_rate <= 0.0 {
            self.throttle_current = self.throttle_target;
        } else {
            let step = self.throttle_rate * dt;
            let gap = self.throttle_target - self.throttle_current;
            if gap.abs() <= step {
                self.throttle_current = self.throttle_target;
            } else {
                self.throttle_current += step * gap.signum();
            }
        }
        Setpoints {
            throttle_percent: self.throttle_current,
            rudder_angle: self.rudder,
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Admits, orders, and executes commands for one boat.
pub struct CommandDispatcher {
    boat_id: String,
    auth_token: Option<String>,
    state: Arc<SharedBoatState>,
    ledger: CommandLedger,
    queue: CommandQueue,
    nav: NavigationController,
    safety: SafetyMonitor,
    intervals: ReportIntervals,
    manual: ManualDemand,
    acks: mpsc::UnboundedSender<AckMessage>,
}

impl CommandDispatcher {
    /// Build a dispatcher from the boat config.
    pub fn new(
        config: &BoatConfig,
        state: Arc<SharedBoatState>,
        acks: mpsc::UnboundedSender<AckMessage>,
    ) -> Self {
        Self {
            boat_id: config.boat_id.clone(),
            auth_token: config.auth_token.clone(),
            state,
            ledger: CommandLedger::new(),
            queue: CommandQueue::new(),
            nav: NavigationController::new(),
            safety: SafetyMonitor::new(config.safety),
            intervals: config.intervals,
            manual: ManualDemand::default(),
            acks,
        }
    }

    /// The current reporting intervals, as changed by config commands.
    pub fn report_intervals(&self) -> ReportIntervals {
        self.intervals
    }

    /// Current navigation mode.
    pub fn nav_mode(&self) -> NavMode {
        self.nav.mode()
    }

    /// The command lifecycle ledger.
    pub fn ledger(&self) -> &CommandLedger {
        &self.ledger
    }

    /// The safety monitor.
    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    // ========================================================================
    // Admission and Execution
    // ========================================================================

    /// Offer a decoded envelope.
    ///
    /// Duplicates are resolved here: finished commands are re-acknowledged
    /// with their recorded terminal state, in-flight ones are dropped. New
    /// commands land in the priority queue for [`Self::process_next`].
    pub fn submit(&mut self, envelope: CommandEnvelope, now: DateTime<Utc>) -> Submission {
        match self.ledger.admit(&envelope, now) {
            Admission::DuplicateTerminal(state) => {
                debug!(command_id = %envelope.command_id, ?state, "duplicate of finished command");
                if envelope.requires_ack {
                    let success = state == CommandState::Completed;
                    self.send_ack(AckMessage::new(
                        &self.boat_id,
                        envelope.command_id,
                        state,
                        success,
                        "duplicate delivery",
                    ));
                }
                Submission::DuplicateTerminal(state)
            }
            Admission::DuplicateInFlight(state) => {
                debug!(command_id = %envelope.command_id, ?state, "duplicate of in-flight command");
                Submission::DuplicateInFlight(state)
            }
            Admission::New => {
                self.safety.note_command();
                self.queue.push(envelope);
                Submission::Queued
            }
        }
    }

    /// Execute the highest-priority queued command, if any.
    pub fn process_next(&mut self, now: DateTime<Utc>) -> Option<ProcessedCommand> {
        let envelope = self.queue.pop()?;
        let command_id = envelope.command_id;

        if let Err(e) = self.ledger.transition(&command_id, CommandState::Sent, now) {
            warn!(command_id = %command_id, error = %e, "cannot start command");
            return Some(ProcessedCommand {
                command_id,
                outcome: DispatchOutcome::Rejected(e.to_string()),
            });
        }
        if envelope.requires_ack {
            self.send_ack(AckMessage::new(
                &self.boat_id,
                command_id,
                CommandState::Sent,
                true,
                "accepted",
            ));
        }

        let outcome = match self.execute(&envelope, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .ledger
                    .fail(&command_id, &FailReason::Other(message.clone()), now);
                warn!(command_id = %command_id, reason = %message, "command refused");
                if envelope.requires_ack {
                    self.send_ack(AckMessage::new(
                        &self.boat_id,
                        command_id,
                        CommandState::Failed,
                        false,
                        message.clone(),
                    ));
                }
                DispatchOutcome::Rejected(message)
            }
        };

        Some(ProcessedCommand {
            command_id,
            outcome,
        })
    }

    fn execute(
        &mut self,
        envelope: &CommandEnvelope,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        match &envelope.payload {
            CommandPayload::Emergency(action) => self.execute_emergency(envelope, action, now),
            CommandPayload::Navigation(action) => self.execute_navigation(envelope, action, now),
            CommandPayload::Control(action) => self.execute_control(envelope, action, now),
            CommandPayload::Status(action) => self.execute_status(envelope, action, now),
            CommandPayload::Config(action) => self.execute_config(envelope, action, now),
        }
    }

    fn execute_emergency(
        &mut self,
        envelope: &CommandEnvelope,
        action: &EmergencyAction,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        match action {
            EmergencyAction::EmergencyStop { reason } => {
                warn!(reason = %reason, "emergency stop commanded");
                if let Some(preempted) = self.nav.emergency_stop() {
                    self.fail_and_ack(&preempted, FailReason::PreemptedByEmergency, now);
                }
                self.manual.clear();
                self.state.set_nav(self.nav.mode(), None);
                self.complete(envelope, format!("emergency stop engaged: {reason}"), None, now);
                Ok(DispatchOutcome::Completed)
            }
            EmergencyAction::Resume { auth_token } => {
                self.check_auth(auth_token)?;
                let message = if self.nav.resume() {
                    "resumed from emergency stop"
                } else {
                    "not emergency stopped"
                };
                self.state.set_nav(self.nav.mode(), None);
                self.complete(envelope, message, None, now);
                Ok(DispatchOutcome::Completed)
            }
        }
    }

    fn execute_navigation(
        &mut self,
        envelope: &CommandEnvelope,
        action: &NavigationAction,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let goal = match *action {
            NavigationAction::SetWaypoint {
                latitude,
                longitude,
                max_speed,
                arrival_radius,
            } => NavGoal::Waypoint {
                latitude,
                longitude,
                max_speed,
                arrival_radius,
            },
            NavigationAction::SetCourse {
                heading,
                speed,
                duration,
            } => NavGoal::Course {
                heading,
                speed,
                duration,
            },
            NavigationAction::HoldPosition { max_drift } => NavGoal::Hold { max_drift },
        };

        let snapshot = self.state.snapshot();
        let intent = NavIntent {
            command_id: envelope.command_id,
            goal,
        };
        let superseded = self
            .nav
            .install(intent, snapshot.fix.as_ref())
            .map_err(|e| match e {
                crate::nav::NavError::NoPosition => DispatchError::NoPosition,
                crate::nav::NavError::EmergencyStopped => DispatchError::EmergencyStopped,
            })?;

        if let Some(old) = superseded {
            self.fail_and_ack(&old, FailReason::Superseded, now);
        }
        self.manual.clear();

        self.ledger
            .transition(&envelope.command_id, CommandState::Acknowledged, now)
            .ok();
        self.state
            .set_nav(self.nav.mode(), Some(envelope.command_id));
        if envelope.requires_ack {
            self.send_ack(AckMessage::new(
                &self.boat_id,
                envelope.command_id,
                CommandState::Acknowledged,
                true,
                "navigation goal active",
            ));
        }
        Ok(DispatchOutcome::InFlight)
    }

    fn execute_control(
        &mut self,
        envelope: &CommandEnvelope,
        action: &ControlAction,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if self.nav.is_emergency_stopped() {
            return Err(DispatchError::EmergencyStopped);
        }

        match *action {
            ControlAction::StopMotors => {
                if let Some(active) = self.nav.stop_navigation() {
                    self.fail_and_ack(
                        &active,
                        FailReason::Other("stopped by operator".to_string()),
                        now,
                    );
                }
                self.manual.clear();
                self.state.set_nav(self.nav.mode(), None);
                self.complete(envelope, "motors stopped", None, now);
                Ok(DispatchOutcome::Completed)
            }
            ControlAction::SetRudder { angle } => {
                if self.nav.active_command().is_some() {
                    return Err(DispatchError::ModeConflict);
                }
                let max = self.safety.limits().max_rudder_angle;
                if angle.abs() > max {
                    return Err(DispatchError::LimitExceeded(format!(
                        "rudder {angle:.1} degrees exceeds limit of {max:.1}"
                    )));
                }
                self.manual.rudder = angle;
                self.complete(envelope, format!("rudder set to {angle:.1} degrees"), None, now);
                Ok(DispatchOutcome::Completed)
            }
            ControlAction::SetThrottle { speed, ramp_time } => {
                if self.nav.active_command().is_some() {
                    return Err(DispatchError::ModeConflict);
                }
                let max = self.safety.limits().max_speed_percent;
                if speed > max {
                    return Err(DispatchError::LimitExceeded(format!(
                        "throttle {speed:.1}% exceeds limit of {max:.1}%"
                    )));
                }
                self.manual.throttle_target = speed;
                self.manual.throttle_rate = if ramp_time > 0.0 {
                    (speed - self.manual.throttle_current).abs() / ramp_time
                } else {
                    0.0
                };
                self.complete(envelope, format!("throttle set to {speed:.1}%"), None, now);
                Ok(DispatchOutcome::Completed)
            }
        }
    }

    fn execute_status(
        &mut self,
        envelope: &CommandEnvelope,
        action: &StatusAction,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let StatusAction::GetStatus { include } = action;
        let data = self.state.status_data(include.as_deref());
        let data = serde_json::to_value(&data).unwrap_or(serde_json::Value::Null);
        self.complete(envelope, "status", Some(data), now);
        Ok(DispatchOutcome::Completed)
    }

    fn execute_config(
        &mut self,
        envelope: &CommandEnvelope,
        action: &ConfigAction,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        match action {
            ConfigAction::UpdateSafetyLimits { auth_token, limits } => {
                self.check_auth(auth_token)?;
                let updated = limits.apply_to(self.safety.limits());
                info!(?updated, "safety limits updated");
                self.safety.swap_limits(updated);
                self.complete(envelope, "safety limits updated", None, now);
                Ok(DispatchOutcome::Completed)
            }
            ConfigAction::SetReportIntervals {
                auth_token,
                intervals,
            } => {
                self.check_auth(auth_token)?;
                self.intervals = self.intervals.apply_patch(intervals);
                info!(intervals = ?self.intervals, "report intervals updated");
                self.complete(envelope, "report intervals updated", None, now);
                Ok(DispatchOutcome::Completed)
            }
        }
    }

    // ========================================================================
    // Control Tick
    // ========================================================================

    /// Advance the control loop one tick.
    ///
    /// Runs the navigation controller, resolves goal completion, and pushes
    /// the demanded setpoints through the safety gate. A stop-class violation
    /// latches the emergency mode and fails the active goal.
    pub fn control_tick(&mut self, dt: f64, now: DateTime<Utc>) -> ControlTickOutput {
        let snapshot = self.state.snapshot();
        let output = self.nav.tick(snapshot.fix.as_ref(), dt);

        if let Some(NavEvent::Completed { command_id }) = output.event {
            self.ledger
                .transition(&command_id, CommandState::Completed, now)
                .ok();
            info!(command_id = %command_id, "navigation goal completed");
            if self.requires_ack(&command_id) {
                self.send_ack(AckMessage::new(
                    &self.boat_id,
                    command_id,
                    CommandState::Completed,
                    true,
                    "navigation goal completed",
                ));
            }
        }

        let demanded = if self.nav.mode() == NavMode::Idle {
            self.manual.tick(dt)
        } else {
            output.setpoints
        };

        let gate = self.safety.assess(&snapshot, demanded);
        let safety_stop = match &gate {
            Gate::Stop(violation) => {
                if let Some(active) = self.nav.emergency_stop() {
                    self.fail_and_ack(&active, FailReason::SafetyOverride, now);
                }
                self.manual.clear();
                Some(violation.clone())
            }
            _ => None,
        };

        self.state.set_nav(self.nav.mode(), self.nav.active_command());

        ControlTickOutput {
            setpoints: gate.setpoints(),
            safety_stop,
        }
    }

    /// Expire overdue commands and evict old terminal entries.
    ///
    /// Returns the evicted entries so the caller can hand them to the
    /// persistence collaborator.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        for entry in self.ledger.sweep(now) {
            if entry.requires_ack {
                self.send_ack(AckMessage::new(
                    &self.boat_id,
                    entry.command_id,
                    CommandState::TimedOut,
                    false,
                    "command timed out",
                ));
            }
        }
        self.ledger.evict(now)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn check_auth(&self, presented: &str) -> Result<(), DispatchError> {
        if BoatConfig::secret_matches(&self.auth_token, presented) {
            Ok(())
        } else {
            Err(DispatchError::AuthRejected)
        }
    }

    fn requires_ack(&self, command_id: &Uuid) -> bool {
        self.ledger
            .get(command_id)
            .map(|e| e.requires_ack)
            .unwrap_or(false)
    }

    /// Walk a command to `completed` and publish the final ack.
    ///
    /// Status responses carry their snapshot in `data` and are published
    /// even when the sender waived acks, since the data is the reply.
    fn complete(
        &mut self,
        envelope: &CommandEnvelope,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) {
        self.ledger
            .transition(&envelope.command_id, CommandState::Acknowledged, now)
            .ok();
        self.ledger
            .transition(&envelope.command_id, CommandState::Completed, now)
            .ok();

        let has_data = data.is_some();
        if envelope.requires_ack || has_data {
            let mut ack = AckMessage::new(
                &self.boat_id,
                envelope.command_id,
                CommandState::Completed,
                true,
                message,
            );
            if let Some(data) = data {
                ack = ack.with_data(data);
            }
            self.send_ack(ack);
        }
    }

    fn fail_and_ack(&mut self, command_id: &Uuid, reason: FailReason, now: DateTime<Utc>) {
        let message = reason.as_str().to_string();
        if let Err(e) = self.ledger.fail(command_id, &reason, now) {
            warn!(command_id = %command_id, error = %e, "cannot fail command");
            return;
        }
        if self.requires_ack(command_id) {
            self.send_ack(AckMessage::new(
                &self.boat_id,
                *command_id,
                CommandState::Failed,
                false,
                message,
            ));
        }
    }

    fn send_ack(&self, ack: AckMessage) {
        if self.acks.send(ack).is_err() {
            warn!("ack channel closed; dropping acknowledgment");
        }
    }
}
