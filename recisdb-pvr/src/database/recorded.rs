//! Recorded-entry and recording-history operations.

use std::path::{Path, PathBuf};

use pvr_types::Program;
use rusqlite::{params, OptionalExtension};

use super::{compact_title, Database, DatabaseError, NewRecording, Result};

/// A row of the recorded table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRecord {
    pub id: i64,
    pub program_id: i64,
    pub channel_id: i64,
    pub rule_id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub start_at: i64,
    pub end_at: i64,
    pub file_path: PathBuf,
    pub file_size: Option<u64>,
    pub is_recording: bool,
}

impl Database {
    /// Insert an in-progress recorded entry.
    pub fn insert_recorded(&self, recording: &NewRecording) -> Result<i64> {
        let program = &recording.program;
        self.conn.execute(
            "INSERT INTO recorded (program_id, channel_id, rule_id, name, description, start_at, end_at, file_path, is_recording)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
            params![
                program.id,
                program.channel_id,
                recording.rule_id,
                program.name,
                program.description,
                program.start_at,
                program.end_at,
                recording.file_path.to_string_lossy(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_recorded(&self, id: i64) -> Result<Option<RecordedRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, program_id, channel_id, rule_id, name, description, start_at, end_at, file_path, file_size, is_recording
                 FROM recorded WHERE id = ?1",
                params![id],
                |row| {
                    Ok(RecordedRecord {
                        id: row.get(0)?,
                        program_id: row.get(1)?,
                        channel_id: row.get(2)?,
                        rule_id: row.get(3)?,
                        name: row.get(4)?,
                        description: row.get(5)?,
                        start_at: row.get(6)?,
                        end_at: row.get(7)?,
                        file_path: PathBuf::from(row.get::<_, String>(8)?),
                        file_size: row.get::<_, Option<i64>>(9)?.map(|s| s.max(0) as u64),
                        is_recording: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Ids of entries still flagged as recording.
    pub fn get_recording_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM recorded WHERE is_recording = 1 ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn set_recorded_finished(&self, id: i64) -> Result<()> {
        self.update_recorded(id, "UPDATE recorded SET is_recording = 0 WHERE id = ?1", params![id])
    }

    /// Refresh the title, description and times from the latest program data.
    pub fn update_recorded_metadata(&self, id: i64, program: &Program) -> Result<()> {
        self.update_recorded(
            id,
            "UPDATE recorded SET name = ?2, description = ?3, start_at = ?4, end_at = ?5 WHERE id = ?1",
            params![id, program.name, program.description, program.start_at, program.end_at],
        )
    }

    pub fn update_recorded_file_size(&self, id: i64, size: u64) -> Result<()> {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        self.update_recorded(
            id,
            "UPDATE recorded SET file_size = ?2 WHERE id = ?1",
            params![id, size],
        )
    }

    pub fn update_recorded_file_path(&self, id: i64, path: &Path) -> Result<()> {
        self.update_recorded(
            id,
            "UPDATE recorded SET file_path = ?2 WHERE id = ?1",
            params![id, path.to_string_lossy()],
        )
    }

    pub fn recorded_exists(&self, id: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM recorded WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn delete_recorded(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM recorded WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Append a compacted title to the duplicate-avoidance history.
    pub fn append_history_entry(&self, name: &str, channel_id: i64, end_at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO recorded_history (name, channel_id, end_at) VALUES (?1, ?2, ?3)",
            params![compact_title(name), channel_id, end_at],
        )?;
        Ok(())
    }

    fn update_recorded(&self, id: i64, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let updated = self.conn.execute(sql, params)?;
        if updated == 0 {
            return Err(DatabaseError::RecordedNotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvr_types::ChannelType;

    fn recording() -> NewRecording {
        NewRecording {
            program: Program::new(7, 100, ChannelType::GR, "27", 1_000, 2_000, "Drama"),
            rule_id: Some(3),
            file_path: PathBuf::from("/rec/Drama.m2ts"),
        }
    }

    #[test]
    fn test_recording_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_recorded(&recording()).unwrap();
        assert_eq!(db.get_recording_ids().unwrap(), vec![id]);

        let mut program = recording().program;
        program.name = "Drama #2".to_string();
        program.end_at = 2_500;
        db.update_recorded_metadata(id, &program).unwrap();
        db.update_recorded_file_size(id, 4096).unwrap();
        db.set_recorded_finished(id).unwrap();

        let record = db.get_recorded(id).unwrap().unwrap();
        assert_eq!(record.name, "Drama #2");
        assert_eq!(record.end_at, 2_500);
        assert_eq!(record.rule_id, Some(3));
        assert_eq!(record.file_size, Some(4096));
        assert!(!record.is_recording);
        assert!(db.get_recording_ids().unwrap().is_empty());

        db.update_recorded_file_path(id, Path::new("/enc/Drama.mp4"))
            .unwrap();
        assert_eq!(
            db.get_recorded(id).unwrap().unwrap().file_path,
            PathBuf::from("/enc/Drama.mp4")
        );
    }

    #[test]
    fn test_missing_entry() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_recorded(&recording()).unwrap();
        db.delete_recorded(id).unwrap();
        assert!(!db.recorded_exists(id).unwrap());
        assert!(matches!(
            db.set_recorded_finished(id),
            Err(DatabaseError::RecordedNotFound(_))
        ));
    }

    #[test]
    fn test_history_is_compacted() {
        let db = Database::open_in_memory().unwrap();
        db.append_history_entry("【新】 ドラマ", 100, 10).unwrap();
        assert!(db.history_contains(&compact_title("新ドラマ"), 0, 20).unwrap());
    }
}
