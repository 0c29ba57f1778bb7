//! Capability traits for the external chess rules engine.

use std::fmt::Debug;

/// A move as the search sees it: copyable, comparable, and mappable onto the
/// network's policy head.
pub trait SearchMove: Copy + Eq + Debug + Send + Sync + 'static {
    /// Stable index of this move in the policy head.
    fn nn_index(&self) -> u16;

    /// UCI text. `flip` mirrors the board for black-to-move reporting.
    fn uci(&self, flip: bool) -> String;
}

/// A game position together with enough of its line to answer history
/// questions (repetitions, halfmove clock, cache hashing).
///
/// Implementations are expected to be cheap to clone; the search clones one
/// position per descent step.
pub trait Position: Clone + PartialEq + Send + Sync + 'static {
    type Move: SearchMove;

    fn legal_moves(&self) -> Vec<Self::Move>;

    /// Policy-head indices of the pseudolegal moves. Used when caching a
    /// position whose legal moves have not been generated yet.
    fn pseudolegal_move_indices(&self) -> Vec<u16>;

    /// The position after `mv`, with history carried forward.
    fn play(&self, mv: Self::Move) -> Self;

    fn is_under_check(&self) -> bool;
    fn has_mating_material(&self) -> bool;

    /// Plies since the last capture or pawn move.
    fn halfmove_clock(&self) -> u32;

    /// How many times this position occurred earlier in the line.
    fn repetitions(&self) -> u32;

    fn game_ply(&self) -> u32;
    fn is_black_to_move(&self) -> bool;

    /// Whether any castling rights remain.
    fn may_castle(&self) -> bool;

    fn piece_count(&self) -> u32;

    /// Zobrist-style hash over the last `positions` positions of the line.
    fn hash_last(&self, positions: usize) -> u64;

    /// Input planes for the evaluator.
    fn encode_for_eval(&self) -> Vec<f32>;
}
