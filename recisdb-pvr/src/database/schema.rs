//! Database schema definitions.

/// SQL schema for the program, rule and recorded tables.
pub const SCHEMA_SQL: &str = r#"
-- EPG programs (filled by the guide importer)
CREATE TABLE IF NOT EXISTS programs (
    id INTEGER PRIMARY KEY,                  -- Program ID (network/service/event derived)
    channel_id INTEGER NOT NULL,
    channel_type TEXT NOT NULL,              -- GR / BS / CS / SKY
    channel TEXT NOT NULL,                   -- Physical channel (tuner sharing key)
    start_at INTEGER NOT NULL,               -- Epoch milliseconds
    end_at INTEGER NOT NULL,                 -- Epoch milliseconds
    name TEXT NOT NULL,
    description TEXT,
    extended TEXT,
    genre INTEGER,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_programs_end_at ON programs(end_at);
CREATE INDEX IF NOT EXISTS idx_programs_channel ON programs(channel_id);

-- Recording rules
CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    enable INTEGER DEFAULT 1,
    keyword TEXT,
    ignore_keyword TEXT,
    channel_ids TEXT,                        -- JSON array of channel IDs (empty = any)
    channel_types TEXT,                      -- JSON array of channel types (empty = any)
    avoid_duplicate INTEGER DEFAULT 0,
    period_to_avoid_duplicate INTEGER DEFAULT 0,  -- Days (0 = unlimited)
    reserve_option TEXT,                     -- JSON ReserveOption
    encode_option TEXT,                      -- JSON EncodeOption
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Recorded entries
CREATE TABLE IF NOT EXISTS recorded (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    program_id INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    rule_id INTEGER,
    name TEXT NOT NULL,
    description TEXT,
    start_at INTEGER NOT NULL,
    end_at INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    file_size INTEGER,
    is_recording INTEGER DEFAULT 1,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_recorded_program ON recorded(program_id);

-- Duplicate-avoidance history (compacted titles)
CREATE TABLE IF NOT EXISTS recorded_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    channel_id INTEGER NOT NULL,
    end_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recorded_history_name ON recorded_history(name);
"#;
