//! cz-logging: append-only NDJSON events for search post-mortems.
//!
//! Events are written one JSON object per line through a line-buffered
//! writer, so a completed line reaches the OS before the next event is
//! accepted. A crash can tear at most the line being written; readers
//! should skip a trailing partial line.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-move search summary, written when a search is retired.
#[derive(Debug, Clone, Serialize)]
pub struct SearchSummaryEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub engine_version: &'static str,

    pub game_ply: u32,
    pub bestmove: String,
    pub ponder: Option<String>,

    pub nodes: u64,
    pub nps: u64,
    pub depth: u32,
    pub seldepth: u32,
    pub time_ms: i64,
    pub tb_hits: u64,
    /// Time banked by smart pruning for the next decision.
    pub bonus_banked_ms: i64,
}

impl SearchSummaryEventV1 {
    pub const EVENT: &'static str = "search_summary";
}

#[derive(Debug, Error)]
pub enum NdjsonError {
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("event serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only NDJSON log. Each event becomes exactly one output line, and
/// line buffering hands every finished line to the OS as it completes.
pub struct NdjsonWriter {
    out: LineWriter<File>,
}

impl NdjsonWriter {
    /// Open (or create) a log file for appending.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, NdjsonError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: LineWriter::new(file),
        })
    }

    pub fn write_event<T: Serialize>(&mut self, event: &T) -> Result<(), NdjsonError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        self.out.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), NdjsonError> {
        self.out.flush()?;
        Ok(())
    }
}
