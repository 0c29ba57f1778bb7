//! Endgame tablebase capability trait.

/// WDL classification from the probed side-to-move's perspective.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WdlScore {
    Loss,
    BlessedLoss,
    Draw,
    CursedWin,
    Win,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProbeState {
    Ok,
    ChangeStm,
    ZeroingBestMove,
    Fail,
}

/// WDL probing over positions of type `P`. Only `ProbeState::Fail` marks a
/// probe result as unusable.
pub trait Tablebase<P>: Send + Sync {
    /// Maximum piece count covered by the loaded tables.
    fn max_cardinality(&self) -> u32;

    fn probe_wdl(&self, pos: &P) -> (WdlScore, ProbeState);
}
