//! Database module for program, rule and recorded-entry storage.
//!
//! This module provides SQLite-based persistent storage for:
//! - EPG programs and recording rules (read by the reservation store)
//! - Recorded entries and the duplicate-avoidance history (written by the recorder)
//!
//! The scheduling core only sees the [`ProgramSource`] and [`RecordedStore`]
//! traits; [`DatabaseHandle`] implements both.

mod handle;
mod program;
mod recorded;
mod rule;
mod schema;
mod title;

pub use handle::DatabaseHandle;
pub use recorded::RecordedRecord;
pub use rule::rule_matches;
pub use title::compact_title;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pvr_types::{Program, Rule, RuleMatch};
use rusqlite::Connection;
use thiserror::Error;

/// Database error types.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid channel type: {0}")]
    ChannelType(String),

    #[error("Recorded entry not found: {0}")]
    RecordedNotFound(i64),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Main database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(())
    }
}

/// Program and rule lookups consumed by the reservation store.
#[async_trait]
pub trait ProgramSource: Send + Sync {
    async fn find_program(&self, id: i64) -> Result<Option<Program>>;

    /// Rule by id, whether enabled or not.
    async fn find_rule(&self, id: i64) -> Result<Option<Rule>>;

    async fn enabled_rules(&self) -> Result<Vec<Rule>>;

    /// Programs ending after `now_ms` that match the rule, with the
    /// duplicate-of-history marker computed.
    async fn find_by_rule(&self, rule: &Rule, now_ms: i64) -> Result<Vec<RuleMatch>>;
}

/// A recording about to be inserted.
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub program: Program,
    pub rule_id: Option<i64>,
    pub file_path: PathBuf,
}

/// Recorded-entry writes performed by recording sessions.
#[async_trait]
pub trait RecordedStore: Send + Sync {
    /// Insert an in-progress row and return its id.
    async fn insert_recording(&self, recording: &NewRecording) -> Result<i64>;

    async fn mark_not_recording(&self, id: i64) -> Result<()>;

    async fn update_metadata(&self, id: i64, program: &Program) -> Result<()>;

    async fn update_file_size(&self, id: i64, size: u64) -> Result<()>;

    async fn update_file_path(&self, id: i64, path: &Path) -> Result<()>;

    async fn exists(&self, id: i64) -> Result<bool>;

    async fn delete(&self, id: i64) -> Result<()>;

    /// Record a finished title for duplicate avoidance.
    async fn append_history(&self, name: &str, channel_id: i64, end_at: i64) -> Result<()>;
}
