//! Search progress and best-move reports delivered through callbacks.

use serde::Serialize;

/// A thinking-info snapshot. `pv` moves are already rendered as UCI text
/// with the board flip applied for black-to-move roots; `comment` carries
/// verbose per-move statistics lines.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThinkingInfo {
    pub depth: u32,
    pub seldepth: u32,
    pub time_ms: i64,
    pub nodes: u64,
    pub nps: u64,
    /// Cache fill factor, permille.
    pub hashfull: u32,
    pub score_cp: Option<i32>,
    pub tb_hits: u64,
    pub pv: Vec<String>,
    pub comment: String,
}

/// The final move report. Moves are raw; the consumer renders them with the
/// flip of the root side to move (ponder with the opposite flip).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestMoveInfo<M> {
    pub bestmove: M,
    pub ponder: Option<M>,
}
