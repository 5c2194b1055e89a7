//! Ground-side boat registry and command tracking.
//!
//! The ground session subscribes to every boat's telemetry and feeds it
//! here. The registry keeps a live picture per boat and flips boats to
//! offline when their heartbeats stop; the tracker mirrors the lifecycle
//! of commands the ground has issued, driven by acks.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::commands::CommandState;
use crate::envelope::{
    AckMessage, CommandEnvelope, GpsMessage, HeartbeatMessage, LogMessage, StatusMessage,
};
use crate::ledger::{Admission, CommandLedger, LedgerEntry, LedgerError};
use crate::nav::NavMode;
use crate::telemetry::GpsFix;

// ============================================================================
// Boat Registry
// ============================================================================

/// Operational state of a boat as the ground sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoatHealth {
    /// Telemetry seen within the timeout window.
    Online,
    /// Heartbeats stopped, or the broker delivered the boat's last will.
    Offline,
    /// The boat reported a fault the operator has not cleared.
    Error,
    /// Taken out of service by the operator. Telemetry does not clear it.
    Maintenance,
}

/// Last known picture of one boat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoatEntry {
    /// The boat's identifier.
    pub boat_id: String,
    /// Online or offline.
    pub health: BoatHealth,
    /// When any telemetry last arrived.
    pub last_seen: DateTime<Utc>,
    /// Latest reported fix.
    pub position: Option<GpsFix>,
    /// Latest reported navigation mode.
    pub nav_mode: Option<NavMode>,
    /// Latest reported battery voltage.
    pub battery_voltage: Option<f64>,
    /// Uptime from the latest heartbeat.
    pub uptime_seconds: Option<f64>,
}

impl BoatEntry {
    fn new(boat_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            boat_id: boat_id.to_string(),
            health: BoatHealth::Online,
            last_seen: now,
            position: None,
            nav_mode: None,
            battery_voltage: None,
            uptime_seconds: None,
        }
    }
}

/// Live picture of every boat the ground station has heard from.
pub struct BoatRegistry {
    boats: HashMap<String, BoatEntry>,
    timeout: Duration,
}

impl Default for BoatRegistry {
    fn default() -> Self {
        Self::new(300)
    }
}

impl BoatRegistry {
    /// Registry that marks boats offline after `timeout_secs` of silence.
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            boats: HashMap::new(),
            timeout: Duration::seconds(timeout_secs as i64),
        }
    }

    /// Number of known boats.
    pub fn len(&self) -> usize {
        self.boats.len()
    }

    /// True when no boat has reported yet.
    pub fn is_empty(&self) -> bool {
        self.boats.is_empty()
    }

    /// The entry for a boat, if it has reported.
    pub fn get(&self, boat_id: &str) -> Option<&BoatEntry> {
        self.boats.get(boat_id)
    }

    /// All known boats.
    pub fn boats(&self) -> impl Iterator<Item = &BoatEntry> {
        self.boats.values()
    }

    /// Number of boats currently online.
    pub fn online_count(&self) -> usize {
        self.boats
            .values()
            .filter(|b| b.health == BoatHealth::Online)
            .count()
    }

    /// Force a boat's health, for operator use (clearing errors, marking
    /// maintenance). Returns false for unknown boats.
    pub fn set_health(&mut self, boat_id: &str, health: BoatHealth) -> bool {
        match self.boats.get_mut(boat_id) {
            Some(entry) => {
                info!(boat_id = %boat_id, ?health, "boat health set by operator");
                entry.health = health;
                true
            }
            None => false,
        }
    }

    /// Mark a boat errored after a critical log entry.
    pub fn apply_log(&mut self, message: &LogMessage, now: DateTime<Utc>) {
        let entry = self.touch(&message.boat_id, now);
        if message.level == "critical" {
            warn!(boat_id = %message.boat_id, detail = %message.message, "boat reported critical fault");
            entry.health = BoatHealth::Error;
        }
    }

    fn touch(&mut self, boat_id: &str, now: DateTime<Utc>) -> &mut BoatEntry {
        let entry = self
            .boats
            .entry(boat_id.to_string())
            .or_insert_with(|| {
                info!(boat_id = %boat_id, "new boat discovered");
                BoatEntry::new(boat_id, now)
            });
        if entry.health == BoatHealth::Offline {
            info!(boat_id = %boat_id, "boat back online");
            entry.health = BoatHealth::Online;
        }
        // Error and maintenance stick until the operator clears them.
        entry.last_seen = now;
        entry
    }

    /// Fold a status report into the boat's entry.
    pub fn apply_status(&mut self, message: &StatusMessage, now: DateTime<Utc>) {
        let entry = self.touch(&message.boat_id, now);
        if let Some(gps) = message.data.gps {
            entry.position = Some(gps);
        }
        if let Some(nav) = &message.data.navigation {
            entry.nav_mode = Some(nav.mode);
        }
        if let Some(system) = message.data.system {
            entry.battery_voltage = Some(system.battery_voltage);
        }
    }

    /// Fold a GPS update into the boat's entry.
    pub fn apply_gps(&mut self, message: &GpsMessage, now: DateTime<Utc>) {
        let entry = self.touch(&message.boat_id, now);
        entry.position = Some(message.data);
    }

    /// Fold a heartbeat into the boat's entry.
    ///
    /// An offline heartbeat is the boat's last will relayed by the broker;
    /// it flips the boat offline immediately.
    pub fn apply_heartbeat(&mut self, message: &HeartbeatMessage, now: DateTime<Utc>) {
        if message.is_offline() {
            if let Some(entry) = self.boats.get_mut(&message.boat_id) {
                warn!(boat_id = %message.boat_id, "boat reported offline by last will");
                entry.health = BoatHealth::Offline;
            }
            return;
        }
        let entry = self.touch(&message.boat_id, now);
        entry.uptime_seconds = Some(message.uptime_seconds);
        if let Some(system) = message.system {
            entry.battery_voltage = Some(system.battery_voltage);
        }
    }

    /// Flip boats silent past the timeout to offline.
    ///
    /// Returns the ids that changed state this sweep.
    pub fn sweep_offline(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut flipped = Vec::new();
        for entry in self.boats.values_mut() {
            if entry.health == BoatHealth::Online && now - entry.last_seen > self.timeout {
                warn!(boat_id = %entry.boat_id, "boat heartbeat timeout");
                entry.health = BoatHealth::Offline;
                flipped.push(entry.boat_id.clone());
            }
        }
        flipped
    }
}

// ============================================================================
// Command Tracker
// ============================================================================

/// Ground-side mirror of issued commands' lifecycles.
///
/// The boat is authoritative; the tracker only follows what acks report,
/// walking intermediate states when an ack skips ahead of the last one
/// seen (acks ride QoS 1 and can arrive out of order or not at all).
pub struct CommandTracker {
    ledger: CommandLedger,
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self {
            ledger: CommandLedger::new(),
        }
    }

    /// Record a command as issued and published.
    pub fn track(&mut self, envelope: &CommandEnvelope, now: DateTime<Utc>) {
        if self.ledger.admit(envelope, now) == Admission::New {
            self.ledger
                .transition(&envelope.command_id, CommandState::Sent, now)
                .ok();
        }
    }

    /// Current state of a tracked command.
    pub fn state(&self, command_id: &Uuid) -> Option<CommandState> {
        self.ledger.state(command_id)
    }

    /// Full entry for a tracked command.
    pub fn get(&self, command_id: &Uuid) -> Option<&LedgerEntry> {
        self.ledger.get(command_id)
    }

    /// Advance a command to the state an ack reports.
    ///
    /// Skipped intermediate states are walked through, so a `completed`
    /// ack lands even when the `acknowledged` ack was lost. Acks for
    /// states already passed are ignored.
    pub fn apply_ack(&mut self, ack: &AckMessage, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let current = self
            .ledger
            .state(&ack.command_id)
            .ok_or(LedgerError::Unknown(ack.command_id))?;

        if current == ack.state || current.is_terminal() {
            return Ok(());
        }

        for step in Self::path(current, ack.state) {
            self.ledger.transition(&ack.command_id, step, now)?;
        }
        Ok(())
    }

    /// Expire commands that never got a terminal ack.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        let expired = self.ledger.sweep(now);
        self.ledger.evict(now);
        expired
    }

    /// The forward steps from `from` to `to`, empty when `to` is behind.
    fn path(from: CommandState, to: CommandState) -> Vec<CommandState> {
        let order = [
            CommandState::Pending,
            CommandState::Sent,
            CommandState::Acknowledged,
            CommandState::Completed,
        ];
        // Failed and timeout are reachable from any non-terminal state.
        if matches!(to, CommandState::Failed | CommandState::TimedOut) {
            if from == CommandState::Acknowledged && to == CommandState::TimedOut {
                // Not a legal move; the boat never times out acknowledged
                // commands, so such an ack is bogus.
                return Vec::new();
            }
            return vec![to];
        }
        let from_idx = order.iter().position(|s| *s == from);
        let to_idx = order.iter().position(|s| *s == to);
        match (from_idx, to_idx) {
            (Some(f), Some(t)) if t > f => order[f + 1..=t].to_vec(),
            _ => Vec::new(),
        }
    }
}
