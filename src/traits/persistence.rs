//! Persistence seam.
//!
//! The engine itself stores nothing durably; finished command entries and
//! telemetry snapshots are handed to this collaborator, which a deployment
//! backs with whatever store it wants. The unit impl discards everything.

use std::convert::Infallible;

use crate::ledger::LedgerEntry;
use crate::telemetry::StatusData;

/// Sink for finished commands and telemetry.
pub trait Persistence {
    /// Error type for store operations.
    type Error;

    /// Record a command that reached a terminal state.
    fn record_command(&mut self, entry: &LedgerEntry) -> Result<(), Self::Error>;

    /// Record a telemetry snapshot for a boat.
    fn record_telemetry(&mut self, boat_id: &str, data: &StatusData) -> Result<(), Self::Error>;
}

/// Discard everything.
impl Persistence for () {
    type Error = Infallible;

    fn record_command(&mut self, _entry: &LedgerEntry) -> Result<(), Self::Error> {
        Ok(())
    }

    fn record_telemetry(&mut self, _boat_id: &str, _data: &StatusData) -> Result<(), Self::Error> {
        Ok(())
    }
}
