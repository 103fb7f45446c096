//! Error types surfaced to callers of reservation operations.

use thiserror::Error;

/// Errors returned by reservation mutations.
///
/// These are thrown back to the caller rather than only logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReserveError {
    /// A manual reservation for this program already exists.
    #[error("Program {0} is already reserved")]
    AlreadyReserved(i64),

    /// The program does not exist in the program table.
    #[error("Program not found: {0}")]
    ProgramNotFound(i64),

    /// No reservation exists for this program.
    #[error("Reservation not found: program {0}")]
    ReserveNotFound(i64),

    /// The reservation belongs to a rule and cannot be edited directly.
    #[error("Reservation for program {0} is owned by a rule")]
    RuleReservation(i64),

    /// The program is being recorded right now.
    #[error("Program {0} is currently recording")]
    Recording(i64),

    /// The operation only applies to rule reservations.
    #[error("Reservation for program {0} is not rule-owned")]
    NotRuleReservation(i64),

    /// Writing the reservation file failed.
    #[error("Failed to persist reservations: {0}")]
    Persist(String),

    /// The program/rule source failed.
    #[error("Program source error: {0}")]
    Source(String),
}
