//! Program table operations.

use pvr_types::{ChannelType, Program};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError, Result};

pub(super) const PROGRAM_COLUMNS: &str =
    "id, channel_id, channel_type, channel, start_at, end_at, name, description, extended, genre";

/// Map a row selected with [`PROGRAM_COLUMNS`]. The channel type is returned
/// raw so a bad value surfaces as [`DatabaseError::ChannelType`].
pub(super) fn program_from_row(row: &Row<'_>) -> rusqlite::Result<(Program, String)> {
    let channel_type: String = row.get(2)?;
    let genre: Option<i64> = row.get(9)?;
    let program = Program {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        channel_type: ChannelType::GR,
        channel: row.get(3)?,
        start_at: row.get(4)?,
        end_at: row.get(5)?,
        name: row.get(6)?,
        description: row.get(7)?,
        extended: row.get(8)?,
        genre: genre.and_then(|g| u8::try_from(g).ok()),
    };
    Ok((program, channel_type))
}

pub(super) fn resolve_channel_type((mut program, raw): (Program, String)) -> Result<Program> {
    program.channel_type = ChannelType::parse(&raw).ok_or(DatabaseError::ChannelType(raw))?;
    Ok(program)
}

impl Database {
    /// Insert or replace a program.
    pub fn upsert_program(&self, program: &Program) -> Result<()> {
        self.conn.execute(
            "INSERT INTO programs (id, channel_id, channel_type, channel, start_at, end_at, name, description, extended, genre)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                channel_id = excluded.channel_id,
                channel_type = excluded.channel_type,
                channel = excluded.channel,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                name = excluded.name,
                description = excluded.description,
                extended = excluded.extended,
                genre = excluded.genre,
                updated_at = strftime('%s', 'now')",
            params![
                program.id,
                program.channel_id,
                program.channel_type.as_str(),
                program.channel,
                program.start_at,
                program.end_at,
                program.name,
                program.description,
                program.extended,
                program.genre.map(i64::from),
            ],
        )?;
        Ok(())
    }

    /// Get a program by id.
    pub fn get_program(&self, id: i64) -> Result<Option<Program>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM programs WHERE id = ?1", PROGRAM_COLUMNS),
                params![id],
                program_from_row,
            )
            .optional()?;
        row.map(resolve_channel_type).transpose()
    }

    /// Programs ending after `now_ms`, ordered by start time.
    pub fn get_upcoming_programs(&self, now_ms: i64) -> Result<Vec<Program>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM programs WHERE end_at > ?1 ORDER BY start_at, id",
            PROGRAM_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![now_ms], program_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(resolve_channel_type).collect()
    }

    /// Remove programs that ended before `before_ms`.
    pub fn delete_ended_programs(&self, before_ms: i64) -> Result<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM programs WHERE end_at < ?1", params![before_ms])?;
        Ok(deleted)
    }
}
