//! Command ledger: deduplication, lifecycle tracking, and timeout sweeps.
//!
//! The ledger is the boat's memory of every command it has seen recently,
//! keyed by `command_id`. It answers one question at admission time: have I
//! seen this before, and if so, where did it get to? A duplicate of a
//! terminal command is re-acknowledged without re-execution; a duplicate of
//! an in-flight command is dropped silently. Either way the effect of a
//! command is applied at most once no matter how often the broker redelivers
//! it.
//!
//! All time-dependent methods take `now` explicitly so tests can drive the
//! clock.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::commands::{CommandState, FailReason};
use crate::envelope::CommandEnvelope;

/// Default number of terminal entries kept before eviction.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default retention of terminal entries before eviction.
pub const DEFAULT_RETENTION_SECONDS: i64 = 3600;

// ============================================================================
// Entries and Admission
// ============================================================================

/// Tracked lifecycle record for one command.
#[derive(Clone, Debug)]
pub struct LedgerEntry {
    /// The command this entry tracks.
    pub command_id: Uuid,
    /// Current lifecycle state.
    pub state: CommandState,
    /// When the command was admitted.
    pub arrived_at: DateTime<Utc>,
    /// Seconds before an unacknowledged command times out.
    pub timeout_seconds: u64,
    /// Whether acks must be published for it.
    pub requires_ack: bool,
    /// When the entry reached a terminal state.
    pub terminal_at: Option<DateTime<Utc>>,
    /// Failure reason, when the terminal state is `failed`.
    pub fail_reason: Option<String>,
}

impl LedgerEntry {
    fn deadline(&self) -> DateTime<Utc> {
        self.arrived_at + Duration::seconds(self.timeout_seconds as i64)
    }
}

/// Outcome of offering a command to the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Never seen before; admitted as `pending`. Execute it.
    New,
    /// Seen before and finished. Re-acknowledge with this state, do not
    /// execute again.
    DuplicateTerminal(CommandState),
    /// Seen before and still in flight. Ignore silently.
    DuplicateInFlight(CommandState),
}

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LedgerError {
    /// The requested transition is not a legal forward step.
    #[error("illegal transition for {command_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// The command whose transition was refused.
        command_id: Uuid,
        /// State it is in.
        from: CommandState,
        /// State that was requested.
        to: CommandState,
    },
    /// No entry for this command id.
    #[error("unknown command: {0}")]
    Unknown(Uuid),
}

// ============================================================================
// Ledger
// ============================================================================

/// Bounded command lifecycle map.
pub struct CommandLedger {
    entries: HashMap<Uuid, LedgerEntry>,
    capacity: usize,
    retention: Duration,
}

impl Default for CommandLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandLedger {
    /// Create a ledger with default capacity and retention.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, Duration::seconds(DEFAULT_RETENTION_SECONDS))
    }

    /// Create a ledger with explicit capacity and terminal-entry retention.
    pub fn with_limits(capacity: usize, retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            retention,
        }
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current state of a command, if tracked.
    pub fn state(&self, command_id: &Uuid) -> Option<CommandState> {
        self.entries.get(command_id).map(|e| e.state)
    }

    /// Full entry for a command, if tracked.
    pub fn get(&self, command_id: &Uuid) -> Option<&LedgerEntry> {
        self.entries.get(command_id)
    }

    /// Offer a command. New ids are inserted as `pending`.
    pub fn admit(&mut self, envelope: &CommandEnvelope, now: DateTime<Utc>) -> Admission {
        if let Some(existing) = self.entries.get(&envelope.command_id) {
            return if existing.state.is_terminal() {
                Admission::DuplicateTerminal(existing.state)
            } else {
                Admission::DuplicateInFlight(existing.state)
            };
        }

        self.entries.insert(
            envelope.command_id,
            LedgerEntry {
                command_id: envelope.command_id,
                state: CommandState::Pending,
                arrived_at: now,
                timeout_seconds: envelope.timeout_seconds,
                requires_ack: envelope.requires_ack,
                terminal_at: None,
                fail_reason: None,
            },
        );
        Admission::New
    }

    /// Apply a lifecycle transition. Illegal moves are errors and leave the
    /// entry untouched.
    pub fn transition(
        &mut self,
        command_id: &Uuid,
        to: CommandState,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let entry = self
            .entries
            .get_mut(command_id)
            .ok_or(LedgerError::Unknown(*command_id))?;

        if !entry.state.can_transition_to(to) {
            return Err(LedgerError::IllegalTransition {
                command_id: *command_id,
                from: entry.state,
                to,
            });
        }

        entry.state = to;
        if to.is_terminal() {
            entry.terminal_at = Some(now);
        }
        Ok(())
    }

    /// Mark a command failed with a reason.
    pub fn fail(
        &mut self,
        command_id: &Uuid,
        reason: &FailReason,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.transition(command_id, CommandState::Failed, now)?;
        if let Some(entry) = self.entries.get_mut(command_id) {
            entry.fail_reason = Some(reason.as_str().to_string());
        }
        Ok(())
    }

    /// Expire unacknowledged commands whose deadline has passed.
    ///
    /// Returns the entries that just timed out so acks can be published.
    /// There is no automatic retry: a timed-out command stays timed out,
    /// and the operator reissues under a new id.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        let mut expired = Vec::new();
        for entry in self.entries.values_mut() {
            let awaiting_ack =
                matches!(entry.state, CommandState::Pending | CommandState::Sent);
            if awaiting_ack && now > entry.deadline() {
                entry.state = CommandState::TimedOut;
                entry.terminal_at = Some(now);
                warn!(command_id = %entry.command_id, "command timed out");
                expired.push(entry.clone());
            }
        }
        expired
    }

    /// Remove terminal entries past retention, plus the oldest terminal
    /// entries beyond capacity. Returns what was removed so it can be handed
    /// to the persistence collaborator.
    ///
    /// In-flight entries are never evicted.
    pub fn evict(&mut self, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        let retention = self.retention;
        let mut evicted: Vec<Uuid> = self
            .entries
            .values()
            .filter(|e| {
                e.terminal_at
                    .map(|t| now - t > retention)
                    .unwrap_or(false)
            })
            .map(|e| e.command_id)
            .collect();

        if self.entries.len() - evicted.len() > self.capacity {
            let mut terminal: Vec<&LedgerEntry> = self
                .entries
                .values()
                .filter(|e| e.terminal_at.is_some() && !evicted.contains(&e.command_id))
                .collect();
            terminal.sort_by_key(|e| e.terminal_at);

            let excess = self.entries.len() - evicted.len() - self.capacity;
            evicted.extend(terminal.iter().take(excess).map(|e| e.command_id));
        }

        evicted
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }
}
