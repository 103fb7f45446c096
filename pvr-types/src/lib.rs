//! Shared types for the recisdb PVR scheduler.
//!
//! This crate defines the data model exchanged between the reservation
//! store, the recorder, the encode queue and any API front-end.
//!
//! # Reservation kinds
//!
//! A reservation is either created by hand or derived from a recording rule.
//! The variant carries the data that only makes sense for that origin:
//!
//! ```rust
//! use pvr_types::{ReserveKind, Reservation, Program, ChannelType};
//!
//! let program = Program::new(1, 100, ChannelType::GR, "27", 1_000, 2_000, "News");
//! let manual = Reservation::manual(program.clone(), 1);
//! assert!(manual.is_manual());
//!
//! let from_rule = Reservation::from_rule(program, 7, false);
//! assert_eq!(from_rule.rule_id(), Some(7));
//! assert!(matches!(from_rule.kind, ReserveKind::Rule { .. }));
//! ```

pub mod error;
pub mod types;

pub use error::ReserveError;
pub use types::{
    ChannelType, EncodeModeRequest, EncodeOption, ManualReserveRequest, Program, Reservation,
    ReserveFilter, ReserveKind, ReserveOption, ReservePage, Rule, RuleMatch,
};
