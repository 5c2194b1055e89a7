//! Command lifecycle and priority system.
//!
//! Every command admitted by the boat moves through a monotonic lifecycle:
//!
//! ```text
//! pending -> sent -> acknowledged -> completed | failed
//!    \________\______________________ timed_out
//! ```
//!
//! Regressions are never applied. [`CommandState::can_transition_to`] is the
//! single source of truth for what moves are legal; the ledger refuses
//! anything else.
//!
//! # Priority
//!
//! Backlogged commands are ordered by [`Priority`] with FIFO ordering inside
//! a priority level. Emergency commands are promoted to [`Priority::Critical`]
//! regardless of what the sender put on the wire, so an emergency stop can
//! never queue behind routine traffic.
//!
//! ```rust
//! use helmlink::{CommandEnvelope, CommandPayload, EmergencyAction, Priority, QueuedCommand};
//!
//! let env = CommandEnvelope::new(
//!     "boat-01",
//!     CommandPayload::Emergency(EmergencyAction::EmergencyStop {
//!         reason: "test".to_string(),
//!     }),
//! )
//! .with_priority(Priority::Low);
//!
//! // Promoted regardless of the wire priority
//! assert_eq!(QueuedCommand::new(env, 0).priority(), Priority::Critical);
//! ```

use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::envelope::{CommandEnvelope, CommandKind};

// ============================================================================
// Priority
// ============================================================================

/// Scheduling priority of a command, ordered low to high.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background traffic (status requests, config reads).
    Low = 0,
    /// Normal traffic. The default when the sender omits a priority.
    #[default]
    Medium = 1,
    /// Operator actions that should jump the queue.
    High = 2,
    /// Emergency traffic. Never buffered behind anything else and never
    /// dropped from the disconnect buffer.
    Critical = 3,
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a tracked command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Admitted but not yet handed to an executor.
    Pending,
    /// Handed to an executor; the first ack has been published.
    Sent,
    /// The executor confirmed receipt and is working on it.
    Acknowledged,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully. Terminal.
    Failed,
    /// Expired before acknowledgment. Terminal.
    #[serde(rename = "timeout")]
    TimedOut,
}

impl CommandState {
    /// True for states no further transition may leave.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Failed | CommandState::TimedOut
        )
    }

    /// Whether moving to `next` is a legal forward step.
    ///
    /// The lifecycle is strictly monotonic. Terminal states accept nothing,
    /// and a state never moves backwards.
    pub const fn can_transition_to(&self, next: CommandState) -> bool {
        match (self, next) {
            (CommandState::Pending, CommandState::Sent)
            | (CommandState::Pending, CommandState::Failed)
            | (CommandState::Pending, CommandState::TimedOut)
            | (CommandState::Sent, CommandState::Acknowledged)
            | (CommandState::Sent, CommandState::Failed)
            | (CommandState::Sent, CommandState::TimedOut)
            | (CommandState::Acknowledged, CommandState::Completed)
            | (CommandState::Acknowledged, CommandState::Failed) => true,
            _ => false,
        }
    }

    /// Wire name of this state.
    pub const fn as_str(&self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Sent => "sent",
            CommandState::Acknowledged => "acknowledged",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::TimedOut => "timeout",
        }
    }
}

/// Why a command was marked failed.
///
/// The protocol-defined reasons are a closed set; anything an executor
/// reports beyond them travels as [`FailReason::Other`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// A newer navigation command replaced this one.
    Superseded,
    /// An emergency stop cancelled this command mid-flight.
    PreemptedByEmergency,
    /// The safety monitor blocked or aborted execution.
    SafetyOverride,
    /// Executor-specific failure detail.
    Other(String),
}

impl FailReason {
    /// Wire string for this reason.
    pub fn as_str(&self) -> &str {
        match self {
            FailReason::Superseded => "superseded",
            FailReason::PreemptedByEmergency => "preempted_by_emergency",
            FailReason::SafetyOverride => "safety_override",
            FailReason::Other(s) => s,
        }
    }
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Prioritized Queue
// ============================================================================

/// A backlogged command with its arrival sequence number.
///
/// Ordering is by effective priority first, then FIFO within a priority
/// level. Implements `Ord` for use with [`BinaryHeap`].
#[derive(Clone, Debug)]
pub struct QueuedCommand {
    /// The command itself.
    pub envelope: CommandEnvelope,
    /// Arrival sequence, assigned by the queue.
    pub seq: u64,
}

impl QueuedCommand {
    /// Wrap an envelope with its arrival sequence.
    pub fn new(envelope: CommandEnvelope, seq: u64) -> Self {
        Self { envelope, seq }
    }

    /// Effective priority, with emergency commands promoted to critical.
    pub fn priority(&self) -> Priority {
        if self.envelope.command_type == CommandKind::Emergency {
            Priority::Critical
        } else {
            self.envelope.priority
        }
    }
}

impl Eq for QueuedCommand {}

impl PartialEq for QueuedCommand {
    fn eq(&self, other: &Self) -> bool {
        self.priority() == other.priority() && self.seq == other.seq
    }
}

impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority wins; equal priority is FIFO, so the lower
        // sequence number must compare greater for the max-heap.
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue for backlogged commands.
#[derive(Debug, Default)]
pub struct CommandQueue {
    heap: BinaryHeap<QueuedCommand>,
    next_seq: u64,
}

impl CommandQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a command, assigning its arrival sequence.
    pub fn push(&mut self, envelope: CommandEnvelope) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedCommand::new(envelope, seq));
    }

    /// Take the highest-priority command, FIFO within a level.
    pub fn pop(&mut self) -> Option<CommandEnvelope> {
        self.heap.pop().map(|q| q.envelope)
    }

    /// Number of backlogged commands.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when nothing is backlogged.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop everything in the backlog, returning what was there.
    pub fn drain(&mut self) -> Vec<CommandEnvelope> {
        self.heap.drain().map(|q| q.envelope).collect()
    }
}
