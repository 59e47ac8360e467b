//! Purpose: Read back the message log a recipe worker wrote and replay it into `tracing`.
//! Exports: `LogEntry`, `parse_log`, `read_log`, `forward_log`.
//! Role: Host-side companion of the log file configured in `RunRequest`.
//! Invariants: Lines without a `HH:MM:SS [LEVEL] function:` prefix continue the previous entry.
//! Invariants: Text before the first prefixed line is dropped.

use std::io;
use std::path::Path;

use serde::{Serialize, Serializer};
use time::Time;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use crate::core::error::{Error, ErrorKind};
use crate::core::harness::LogLevel;

const CLOCK: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

/// One message from a recipe log, e.g. `10:35:25 [WARNING] rtest: [tid=000] No file tagged with FLAT`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LogEntry {
    #[serde(serialize_with = "serialize_clock")]
    pub time: Time,
    pub level: LogLevel,
    pub function: String,
    pub thread: Option<u32>,
    pub message: String,
}

fn serialize_clock<S: Serializer>(time: &Time, serializer: S) -> Result<S::Ok, S::Error> {
    let text = time.format(CLOCK).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&text)
}

/// Parses a whole log file body into entries, in file order.
pub fn parse_log(text: &str) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(entry) = parse_line(line) {
            entries.push(entry);
        } else if let Some(previous) = entries.last() {
            let continued = LogEntry {
                message: line.trim_end().to_string(),
                ..previous.clone()
            };
            entries.push(continued);
        }
    }
    entries
}

fn parse_line(line: &str) -> Option<LogEntry> {
    let (clock, rest) = line.split_once(' ')?;
    let time = Time::parse(clock, CLOCK).ok()?;

    let rest = rest.trim_start().strip_prefix('[')?;
    let (level, rest) = rest.split_once(']')?;
    let level = LogLevel::parse(level.trim()).filter(|level| *level != LogLevel::Off)?;

    let (function, rest) = rest.trim_start().split_once(':')?;
    if function.is_empty() || !function.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return None;
    }

    let rest = rest.strip_prefix(' ')?;
    let (thread, message) = match rest.strip_prefix("[tid=") {
        Some(tagged) => {
            let (id, message) = tagged.split_once(']')?;
            (Some(id.parse().ok()?), message.strip_prefix(' ')?)
        }
        None => (None, rest),
    };
    if message.is_empty() {
        return None;
    }

    Some(LogEntry {
        time,
        level,
        function: function.to_string(),
        thread,
        message: message.trim_end().to_string(),
    })
}

/// Reads and parses a recipe log. A missing file means the recipe logged nothing.
pub fn read_log(path: &Path) -> Result<Vec<LogEntry>, Error> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(parse_log(&String::from_utf8_lossy(&bytes))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(Error::new(ErrorKind::Io)
            .with_message("failed to read recipe log")
            .with_path(path)
            .with_source(err)),
    }
}

/// Replays entries at or above `threshold` as `tracing` events under the recipe's name.
pub fn forward_log(recipe: &str, entries: &[LogEntry], threshold: LogLevel) {
    for entry in entries.iter().filter(|entry| entry.level >= threshold) {
        let function = entry.function.as_str();
        let message = entry.message.as_str();
        let thread = entry.thread;
        match entry.level {
            LogLevel::Debug => tracing::debug!(recipe, function, thread, "{message}"),
            LogLevel::Info => tracing::info!(recipe, function, thread, "{message}"),
            LogLevel::Warning => tracing::warn!(recipe, function, thread, "{message}"),
            LogLevel::Error => tracing::error!(recipe, function, thread, "{message}"),
            LogLevel::Off => {}
        }
    }
}
