//! Destination file naming.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use pvr_types::Program;

/// Default file name format.
pub const DEFAULT_FORMAT: &str = "%YEAR%%MONTH%%DAY%%HOUR%%MIN%-%TITLE%";

/// Characters not allowed in file names on common file systems.
const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Expand a file name format for `program`. The result has no extension.
pub fn format_file_name(program: &Program, format: Option<&str>) -> String {
    let format = format.filter(|f| !f.is_empty()).unwrap_or(DEFAULT_FORMAT);
    let start = Local
        .timestamp_millis_opt(program.start_at)
        .single()
        .unwrap_or_else(|| Local.timestamp_nanos(0));

    let name = format
        .replace("%YEAR%", &start.format("%Y").to_string())
        .replace("%SHORTYEAR%", &start.format("%y").to_string())
        .replace("%MONTH%", &start.format("%m").to_string())
        .replace("%DAY%", &start.format("%d").to_string())
        .replace("%HOUR%", &start.format("%H").to_string())
        .replace("%MIN%", &start.format("%M").to_string())
        .replace("%SEC%", &start.format("%S").to_string())
        .replace("%PROGRAMID%", &program.id.to_string())
        .replace("%CHID%", &program.channel_id.to_string())
        .replace("%CHTYPE%", program.channel_type.as_str())
        .replace("%TITLE%", &program.name);

    sanitize(&name)
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// First of `stem.ext`, `stem(1).ext`, `stem(2).ext`, ... that does not exist.
///
/// `ext` includes its leading dot.
pub async fn unique_path(dir: &Path, stem: &str, ext: &str) -> io::Result<PathBuf> {
    let mut candidate = dir.join(format!("{}{}", stem, ext));
    let mut n = 1u32;
    while tokio::fs::try_exists(&candidate).await? {
        candidate = dir.join(format!("{}({}){}", stem, n, ext));
        n += 1;
    }
    Ok(candidate)
}

/// Create `dir` if needed and pick a free file name inside it.
pub async fn prepare_destination(dir: &Path, stem: &str, ext: &str) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    unique_path(dir, stem, ext).await
}
