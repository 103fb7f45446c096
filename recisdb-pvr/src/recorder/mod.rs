//! Recording scheduling and execution.
//!
//! - [`RecordingManager`]: periodic check, stop and housekeeping
//! - [`RecordingSession`]: per-reservation state machine
//! - [`path`]: destination file naming

pub mod manager;
pub mod path;
pub mod session;

pub use manager::{spawn_encode_listener, RecordingManager, SessionInfo};
pub use session::{
    RecorderSettings, RecordingSession, SessionContext, SessionOutcome, SessionPhase,
    SessionStatus,
};
