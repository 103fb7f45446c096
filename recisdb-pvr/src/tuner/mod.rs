//! Tuner capabilities and stream sources.
//!
//! - [`TunerDevice`]: configured tuner and its receivable channel types
//! - [`TunerSlot`]: per-pass allocation state used by the conflict resolver
//! - [`TunerSource`]: provider of recording byte streams

pub mod device;
pub mod source;

pub use device::{ChannelKey, TunerDevice, TunerSlot};
pub use source::{MirakurunSource, SourceError, TunerSource, TunerStream};
