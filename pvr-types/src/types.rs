//! Reservation, program and rule type definitions.

use serde::{Deserialize, Serialize};

/// Broadcast channel type.
///
/// Tuners advertise the channel types they can receive; a reservation can
/// only be placed on a tuner supporting its program's channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelType {
    /// Digital terrestrial (地上波)
    GR,
    /// BS satellite
    BS,
    /// 110度CS satellite
    CS,
    /// 124/128度CS (スカパー!プレミアムサービス)
    SKY,
}

impl ChannelType {
    /// Name used in tuner-source URLs and database columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::GR => "GR",
            ChannelType::BS => "BS",
            ChannelType::CS => "CS",
            ChannelType::SKY => "SKY",
        }
    }

    /// Parse from the database/URL representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GR" => Some(ChannelType::GR),
            "BS" => Some(ChannelType::BS),
            "CS" => Some(ChannelType::CS),
            "SKY" => Some(ChannelType::SKY),
            _ => None,
        }
    }
}

/// A broadcast program from the EPG.
///
/// Times are UNIX epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: i64,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    /// Physical channel (transponder) string. Programs on the same physical
    /// channel can share one tuner.
    pub channel: String,
    pub start_at: i64,
    pub end_at: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub extended: Option<String>,
    #[serde(default)]
    pub genre: Option<u8>,
}

impl Program {
    /// Create a program with the required fields.
    pub fn new(
        id: i64,
        channel_id: i64,
        channel_type: ChannelType,
        channel: &str,
        start_at: i64,
        end_at: i64,
        name: &str,
    ) -> Self {
        Self {
            id,
            channel_id,
            channel_type,
            channel: channel.to_string(),
            start_at,
            end_at,
            name: name.to_string(),
            description: None,
            extended: None,
            genre: None,
        }
    }

    /// Program duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.end_at - self.start_at).max(0)
    }
}

/// Per-reservation recording overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveOption {
    /// Sub-directory below the recording directory.
    #[serde(default)]
    pub directory: Option<String>,
    /// File name format, e.g. `%YEAR%%MONTH%%DAY%-%TITLE%`.
    #[serde(default)]
    pub recorded_format: Option<String>,
}

/// One requested encode pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeModeRequest {
    /// Name of a configured encode mode.
    pub mode: String,
    /// Output directory override.
    #[serde(default)]
    pub directory: Option<String>,
}

/// Encode instructions attached to a reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeOption {
    pub modes: Vec<EncodeModeRequest>,
    /// Delete the recorded TS once the last encode pass concludes.
    #[serde(default)]
    pub del_ts: bool,
}

/// Origin of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReserveKind {
    /// Added by hand.
    Manual { manual_id: i64 },
    /// Derived from a recording rule.
    Rule {
        rule_id: i64,
        /// The program duplicates an already recorded title.
        is_overlap: bool,
        /// The user re-enabled recording despite the duplicate.
        disable_overlap: bool,
    },
}

/// Scheduled intent to record a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub program: Program,
    pub kind: ReserveKind,
    #[serde(default)]
    pub is_skip: bool,
    /// Recomputed by the allocator on every store mutation.
    #[serde(default)]
    pub is_conflict: bool,
    #[serde(default)]
    pub option: Option<ReserveOption>,
    #[serde(default)]
    pub encode: Option<EncodeOption>,
}

impl Reservation {
    /// Create a manual reservation.
    pub fn manual(program: Program, manual_id: i64) -> Self {
        Self {
            program,
            kind: ReserveKind::Manual { manual_id },
            is_skip: false,
            is_conflict: false,
            option: None,
            encode: None,
        }
    }

    /// Create a rule reservation.
    pub fn from_rule(program: Program, rule_id: i64, is_overlap: bool) -> Self {
        Self {
            program,
            kind: ReserveKind::Rule {
                rule_id,
                is_overlap,
                disable_overlap: false,
            },
            is_skip: false,
            is_conflict: false,
            option: None,
            encode: None,
        }
    }

    pub fn program_id(&self) -> i64 {
        self.program.id
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.kind, ReserveKind::Manual { .. })
    }

    pub fn manual_id(&self) -> Option<i64> {
        match self.kind {
            ReserveKind::Manual { manual_id } => Some(manual_id),
            ReserveKind::Rule { .. } => None,
        }
    }

    pub fn rule_id(&self) -> Option<i64> {
        match self.kind {
            ReserveKind::Rule { rule_id, .. } => Some(rule_id),
            ReserveKind::Manual { .. } => None,
        }
    }

    /// Whether the rule match duplicates history and was not re-enabled.
    pub fn is_overlap_suppressed(&self) -> bool {
        matches!(
            self.kind,
            ReserveKind::Rule {
                is_overlap: true,
                disable_overlap: false,
                ..
            }
        )
    }

    /// Whether the allocator should try to place this reservation on a tuner.
    pub fn wants_tuner(&self) -> bool {
        !self.is_skip && !self.is_overlap_suppressed()
    }

    /// Whether the recorder should record this reservation.
    pub fn is_active(&self) -> bool {
        self.wants_tuner() && !self.is_conflict
    }

    /// Allocation priority; smaller sorts first.
    ///
    /// Manual reservations precede rule reservations, each ordered by id.
    pub fn priority_key(&self) -> (u8, i64) {
        match self.kind {
            ReserveKind::Manual { manual_id } => (0, manual_id),
            ReserveKind::Rule { rule_id, .. } => (1, rule_id),
        }
    }
}

/// Request body for adding a manual reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualReserveRequest {
    pub program_id: i64,
    #[serde(default)]
    pub option: Option<ReserveOption>,
    #[serde(default)]
    pub encode: Option<EncodeOption>,
}

/// Recording rule as stored in the rule table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub enable: bool,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub ignore_keyword: Option<String>,
    #[serde(default)]
    pub channel_ids: Vec<i64>,
    #[serde(default)]
    pub channel_types: Vec<ChannelType>,
    #[serde(default)]
    pub avoid_duplicate: bool,
    /// Days to look back in history; 0 means unlimited.
    #[serde(default)]
    pub period_to_avoid_duplicate: u32,
    #[serde(default)]
    pub option: Option<ReserveOption>,
    #[serde(default)]
    pub encode: Option<EncodeOption>,
}

/// A program matched by a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub program: Program,
    /// Title already appears in the recording history.
    pub is_duplicate_of_history: bool,
}

/// Reservation list filter for paginated queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveFilter {
    All,
    /// Will be recorded: not skipped, not conflicting, not overlap-suppressed.
    Active,
    Conflict,
    Skip,
    Overlap,
}

impl ReserveFilter {
    pub fn matches(&self, reserve: &Reservation) -> bool {
        match self {
            ReserveFilter::All => true,
            ReserveFilter::Active => reserve.is_active(),
            ReserveFilter::Conflict => reserve.is_conflict,
            ReserveFilter::Skip => reserve.is_skip,
            ReserveFilter::Overlap => reserve.is_overlap_suppressed(),
        }
    }
}

/// One page of a reservation query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservePage {
    pub items: Vec<Reservation>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(id: i64) -> Program {
        Program::new(id, 1, ChannelType::GR, "27", 0, 60_000, "test")
    }

    #[test]
    fn test_priority_key_orders_manual_first() {
        let manual = Reservation::manual(program(1), 5);
        let rule = Reservation::from_rule(program(2), 1, false);
        assert!(manual.priority_key() < rule.priority_key());

        let rule_low = Reservation::from_rule(program(3), 2, false);
        assert!(rule.priority_key() < rule_low.priority_key());
    }

    #[test]
    fn test_overlap_suppression() {
        let mut reserve = Reservation::from_rule(program(1), 1, true);
        assert!(reserve.is_overlap_suppressed());
        assert!(!reserve.wants_tuner());

        if let ReserveKind::Rule { disable_overlap, .. } = &mut reserve.kind {
            *disable_overlap = true;
        }
        assert!(!reserve.is_overlap_suppressed());
        assert!(reserve.is_active());
    }

    #[test]
    fn test_filter_matches() {
        let mut reserve = Reservation::manual(program(1), 1);
        assert!(ReserveFilter::Active.matches(&reserve));
        reserve.is_conflict = true;
        assert!(!ReserveFilter::Active.matches(&reserve));
        assert!(ReserveFilter::Conflict.matches(&reserve));
        assert!(ReserveFilter::All.matches(&reserve));
        assert!(!ReserveFilter::Skip.matches(&reserve));
    }

    #[test]
    fn test_kind_serializes_tagged() {
        let reserve = Reservation::manual(program(1), 3);
        let json = serde_json::to_value(&reserve).unwrap();
        assert_eq!(json["kind"]["type"], "manual");
        assert_eq!(json["kind"]["manual_id"], 3);
        assert_eq!(json["program"]["channel_type"], "GR");
    }
}
