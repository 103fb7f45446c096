//! Post-recording encoding.
//!
//! - [`EncodeProcessPool`]: bounded process slots with priority preemption
//! - [`EncodeManager`]: FIFO single-flight dispatcher feeding the pool
//! - [`command`]: command template expansion

pub mod command;
pub mod manager;
pub mod pool;

pub use manager::{EncodeError, EncodeInfo, EncodeJobInfo, EncodeManager, EncodeMode, EncodeRequest};
pub use pool::{EncodeProcess, EncodeProcessPool, PoolError, ProcessExit, ProcessKiller, ProcessSpec};
