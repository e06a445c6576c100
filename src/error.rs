//! Error types for the ride-share ledger.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur while building, settling or persisting the ledger.
///
/// None of these are fatal; every variant is recoverable at the request boundary.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Input rejected before it reaches the ledger (empty passenger list,
    /// non-positive distance or price, blank name, ...)
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// There are no active rides to compute debts from
    #[error("No active rides to compute debts from")]
    NoActiveRides,

    /// Settlement was requested without a computed, non-empty set of debts
    #[error("No debts to settle")]
    NothingToSettle,

    /// No ride with this identifier in the collection consulted
    #[error("Ride not found: {0}")]
    RideNotFound(String),

    /// No person with this identifier or name on the roster
    #[error("Person not found: {0}")]
    PersonNotFound(String),

    /// The stored snapshot moved on since it was loaded
    #[error("Stale state: expected revision {expected}, store is at {found}")]
    StaleState { expected: u64, found: u64 },

    /// Another writer holds the storage lock
    #[error("Timed out waiting for lock on {}", .path.display())]
    LockTimeout { path: PathBuf },

    /// Failed to read or write a file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing or writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Malformed state file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    /// Shorthand for an [`LedgerError::InvalidInput`].
    pub fn invalid(message: impl Into<String>) -> Self {
        LedgerError::InvalidInput {
            message: message.into(),
        }
    }

    /// `true` for the outcomes that mean "nothing to do" rather than failure.
    pub fn is_recoverable_noop(&self) -> bool {
        matches!(self, LedgerError::NoActiveRides | LedgerError::NothingToSettle)
    }

    /// `true` when retrying the whole read-modify-write may succeed.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            LedgerError::StaleState { .. } | LedgerError::LockTimeout { .. }
        )
    }
}
