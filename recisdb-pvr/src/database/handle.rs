//! Shared async handle over the SQLite connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pvr_types::{Program, Rule, RuleMatch};
use tokio::sync::{Mutex, MutexGuard};

use super::{Database, NewRecording, ProgramSource, RecordedStore, Result};

/// Cloneable handle to the database, shared between the service components.
#[derive(Clone)]
pub struct DatabaseHandle(Arc<Mutex<Database>>);

impl DatabaseHandle {
    pub fn new(db: Database) -> Self {
        Self(Arc::new(Mutex::new(db)))
    }

    /// Lock the connection for direct access.
    pub async fn lock(&self) -> MutexGuard<'_, Database> {
        self.0.lock().await
    }
}

#[async_trait]
impl ProgramSource for DatabaseHandle {
    async fn find_program(&self, id: i64) -> Result<Option<Program>> {
        self.lock().await.get_program(id)
    }

    async fn find_rule(&self, id: i64) -> Result<Option<Rule>> {
        self.lock().await.get_rule(id)
    }

    async fn enabled_rules(&self) -> Result<Vec<Rule>> {
        self.lock().await.get_enabled_rules()
    }

    async fn find_by_rule(&self, rule: &Rule, now_ms: i64) -> Result<Vec<RuleMatch>> {
        self.lock().await.find_programs_by_rule(rule, now_ms)
    }
}

#[async_trait]
impl RecordedStore for DatabaseHandle {
    async fn insert_recording(&self, recording: &NewRecording) -> Result<i64> {
        self.lock().await.insert_recorded(recording)
    }

    async fn mark_not_recording(&self, id: i64) -> Result<()> {
        self.lock().await.set_recorded_finished(id)
    }

    async fn update_metadata(&self, id: i64, program: &Program) -> Result<()> {
        self.lock().await.update_recorded_metadata(id, program)
    }

    async fn update_file_size(&self, id: i64, size: u64) -> Result<()> {
        self.lock().await.update_recorded_file_size(id, size)
    }

    async fn update_file_path(&self, id: i64, path: &Path) -> Result<()> {
        self.lock().await.update_recorded_file_path(id, path)
    }

    async fn exists(&self, id: i64) -> Result<bool> {
        self.lock().await.recorded_exists(id)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.lock().await.delete_recorded(id)
    }

    async fn append_history(&self, name: &str, channel_id: i64, end_at: i64) -> Result<()> {
        self.lock().await.append_history_entry(name, channel_id, end_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvr_types::ChannelType;

    #[tokio::test]
    async fn test_handle_implements_both_traits() {
        let handle = DatabaseHandle::new(Database::open_in_memory().unwrap());
        let program = Program::new(1, 1, ChannelType::GR, "27", 0, 1_000, "News");
        handle.lock().await.upsert_program(&program).unwrap();

        let source: Arc<dyn ProgramSource> = Arc::new(handle.clone());
        assert_eq!(source.find_program(1).await.unwrap(), Some(program.clone()));

        let store: Arc<dyn RecordedStore> = Arc::new(handle);
        let id = store
            .insert_recording(&NewRecording {
                program,
                rule_id: None,
                file_path: "/tmp/a.m2ts".into(),
            })
            .await
            .unwrap();
        assert!(store.exists(id).await.unwrap());
        store.mark_not_recording(id).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(!store.exists(id).await.unwrap());
    }
}
