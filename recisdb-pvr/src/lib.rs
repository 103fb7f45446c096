//! recisdb-pvr: recording scheduler, tuner allocator and encode queue.
//!
//! The [`reserve::ReservationStore`] owns the reservation list and re-runs
//! the tuner allocator on every mutation. The [`recorder::RecordingManager`]
//! turns active reservations into recordings, and finished recordings are
//! handed to the [`encode::EncodeManager`], which runs external encoders in
//! a bounded [`encode::EncodeProcessPool`].

pub mod config;
pub mod database;
pub mod encode;
pub mod event;
pub mod logging;
pub mod recorder;
pub mod reserve;
pub mod service;
pub mod tuner;
#[cfg(feature = "webhook")]
pub mod webhook;

pub use service::PvrService;
