//! Rule table operations and rule matching.

use pvr_types::{ChannelType, EncodeOption, Program, ReserveOption, Rule, RuleMatch};
use rusqlite::{params, OptionalExtension, Row};

use super::{compact_title, Database, Result};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

const RULE_COLUMNS: &str = "id, enable, keyword, ignore_keyword, channel_ids, channel_types, avoid_duplicate, period_to_avoid_duplicate, reserve_option, encode_option";

/// Raw rule row with its JSON columns still encoded.
struct RuleRow {
    id: i64,
    enable: bool,
    keyword: Option<String>,
    ignore_keyword: Option<String>,
    channel_ids: Option<String>,
    channel_types: Option<String>,
    avoid_duplicate: bool,
    period: i64,
    reserve_option: Option<String>,
    encode_option: Option<String>,
}

impl RuleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            enable: row.get::<_, Option<bool>>(1)?.unwrap_or(true),
            keyword: row.get(2)?,
            ignore_keyword: row.get(3)?,
            channel_ids: row.get(4)?,
            channel_types: row.get(5)?,
            avoid_duplicate: row.get::<_, Option<bool>>(6)?.unwrap_or(false),
            period: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
            reserve_option: row.get(8)?,
            encode_option: row.get(9)?,
        })
    }

    fn decode(self) -> Result<Rule> {
        let channel_ids: Vec<i64> = decode_json(self.channel_ids)?.unwrap_or_default();
        let channel_types: Vec<ChannelType> = decode_json(self.channel_types)?.unwrap_or_default();
        let option: Option<ReserveOption> = decode_json(self.reserve_option)?;
        let encode: Option<EncodeOption> = decode_json(self.encode_option)?;
        Ok(Rule {
            id: self.id,
            enable: self.enable,
            keyword: self.keyword,
            ignore_keyword: self.ignore_keyword,
            channel_ids,
            channel_types,
            avoid_duplicate: self.avoid_duplicate,
            period_to_avoid_duplicate: u32::try_from(self.period.max(0)).unwrap_or(u32::MAX),
            option,
            encode,
        })
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(column: Option<String>) -> Result<Option<T>> {
    match column {
        Some(text) if !text.trim().is_empty() => Ok(Some(serde_json::from_str(&text)?)),
        _ => Ok(None),
    }
}

fn encode_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

/// Whether `program` satisfies the rule's keyword and channel filters.
pub fn rule_matches(rule: &Rule, program: &Program) -> bool {
    if !rule.channel_ids.is_empty() && !rule.channel_ids.contains(&program.channel_id) {
        return false;
    }
    if !rule.channel_types.is_empty() && !rule.channel_types.contains(&program.channel_type) {
        return false;
    }

    let haystack = format!(
        "{} {}",
        program.name,
        program.description.as_deref().unwrap_or("")
    )
    .to_lowercase();

    if let Some(keyword) = rule.keyword.as_deref().filter(|k| !k.is_empty()) {
        if !haystack.contains(&keyword.to_lowercase()) {
            return false;
        }
    }
    if let Some(ignore) = rule.ignore_keyword.as_deref().filter(|k| !k.is_empty()) {
        if haystack.contains(&ignore.to_lowercase()) {
            return false;
        }
    }
    true
}

impl Database {
    /// Insert a rule and return its id. `rule.id` is ignored.
    pub fn insert_rule(&self, rule: &Rule) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO rules (enable, keyword, ignore_keyword, channel_ids, channel_types, avoid_duplicate, period_to_avoid_duplicate, reserve_option, encode_option)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rule.enable,
                rule.keyword,
                rule.ignore_keyword,
                serde_json::to_string(&rule.channel_ids)?,
                serde_json::to_string(&rule.channel_types)?,
                rule.avoid_duplicate,
                i64::from(rule.period_to_avoid_duplicate),
                encode_json(&rule.option)?,
                encode_json(&rule.encode)?,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Enable or disable a rule.
    pub fn set_rule_enabled(&self, id: i64, enable: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE rules SET enable = ?2 WHERE id = ?1",
            params![id, enable],
        )?;
        Ok(())
    }

    pub fn delete_rule(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Get a rule by id.
    pub fn get_rule(&self, id: i64) -> Result<Option<Rule>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM rules WHERE id = ?1", RULE_COLUMNS),
                params![id],
                RuleRow::from_row,
            )
            .optional()?;
        row.map(RuleRow::decode).transpose()
    }

    /// All enabled rules ordered by id.
    pub fn get_enabled_rules(&self) -> Result<Vec<Rule>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM rules WHERE enable = 1 ORDER BY id",
            RULE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], RuleRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RuleRow::decode).collect()
    }

    /// Whether a compacted title was recorded within the lookback window.
    ///
    /// A `period_days` of 0 searches the whole history.
    pub fn history_contains(&self, compact: &str, period_days: u32, now_ms: i64) -> Result<bool> {
        let since = if period_days == 0 {
            i64::MIN
        } else {
            now_ms - i64::from(period_days) * DAY_MS
        };
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM recorded_history WHERE name = ?1 AND end_at >= ?2",
            params![compact, since],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Upcoming programs matching the rule, with duplicate markers.
    pub fn find_programs_by_rule(&self, rule: &Rule, now_ms: i64) -> Result<Vec<RuleMatch>> {
        let mut matches = Vec::new();
        for program in self.get_upcoming_programs(now_ms)? {
            if !rule_matches(rule, &program) {
                continue;
            }
            let is_duplicate_of_history = rule.avoid_duplicate
                && self.history_contains(
                    &compact_title(&program.name),
                    rule.period_to_avoid_duplicate,
                    now_ms,
                )?;
            matches.push(RuleMatch {
                program,
                is_duplicate_of_history,
            });
        }
        Ok(matches)
    }
}
