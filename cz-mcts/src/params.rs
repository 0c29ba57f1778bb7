//! Search options and per-move limits.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("invalid search option: {msg}")]
    OutOfRange { msg: &'static str },
}

/// Tunable search options with their optimized defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Evaluation batch width.
    pub minibatch_size: usize,
    /// Upper cap on cache-prefetch attempts per evaluator call.
    pub max_prefetch_batch: usize,
    /// PUCT exploration constant.
    pub cpuct: f32,
    /// Root move-selection temperature.
    pub temperature: f32,
    /// Moves over which the temperature decays to zero.
    pub temp_decay_moves: u32,
    /// Dirichlet noise at the root.
    pub noise: bool,
    /// Emit one comment line per root move when the search stops.
    pub verbose_stats: bool,
    /// Smart-pruning aggressiveness (divisor on remaining playouts).
    pub futile_search_aversion: f32,
    /// First-play-urgency reduction coefficient.
    pub fpu_reduction: f32,
    /// Positions back from the head included in the cache key.
    pub cache_history_length: usize,
    /// Softmax temperature applied to raw policy priors.
    pub policy_softmax_temp: f32,
    /// Node collisions tolerated per batch before the worker gives up.
    pub allowed_node_collisions: usize,
    /// Back up cache-hit and terminal leaves before the batch completes.
    pub out_of_order_eval: bool,
    /// Take a terminal win as soon as it is seen, ignoring exploration.
    pub sticky_checkmate: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            minibatch_size: 256,
            max_prefetch_batch: 32,
            cpuct: 3.4,
            temperature: 0.0,
            temp_decay_moves: 0,
            noise: false,
            verbose_stats: false,
            futile_search_aversion: 1.33,
            fpu_reduction: 0.9,
            cache_history_length: 1,
            policy_softmax_temp: 2.2,
            allowed_node_collisions: 32,
            out_of_order_eval: false,
            sticky_checkmate: false,
        }
    }
}

impl SearchParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if !(1..=1024).contains(&self.minibatch_size) {
            return Err(ParamsError::OutOfRange {
                msg: "minibatch_size must be in 1..=1024",
            });
        }
        if self.max_prefetch_batch > 1024 {
            return Err(ParamsError::OutOfRange {
                msg: "max_prefetch_batch must be in 0..=1024",
            });
        }
        if !(self.cpuct.is_finite() && (0.0..=100.0).contains(&self.cpuct)) {
            return Err(ParamsError::OutOfRange {
                msg: "cpuct must be in 0..=100",
            });
        }
        if !(self.temperature.is_finite() && (0.0..=100.0).contains(&self.temperature)) {
            return Err(ParamsError::OutOfRange {
                msg: "temperature must be in 0..=100",
            });
        }
        if self.temp_decay_moves > 100 {
            return Err(ParamsError::OutOfRange {
                msg: "temp_decay_moves must be in 0..=100",
            });
        }
        if !(self.futile_search_aversion.is_finite()
            && (0.0..=10.0).contains(&self.futile_search_aversion))
        {
            return Err(ParamsError::OutOfRange {
                msg: "futile_search_aversion must be in 0..=10",
            });
        }
        if !(self.fpu_reduction.is_finite() && (-100.0..=100.0).contains(&self.fpu_reduction)) {
            return Err(ParamsError::OutOfRange {
                msg: "fpu_reduction must be in -100..=100",
            });
        }
        if self.cache_history_length > 7 {
            return Err(ParamsError::OutOfRange {
                msg: "cache_history_length must be in 0..=7",
            });
        }
        if !(self.policy_softmax_temp.is_finite()
            && (0.1..=10.0).contains(&self.policy_softmax_temp))
        {
            return Err(ParamsError::OutOfRange {
                msg: "policy_softmax_temp must be in 0.1..=10",
            });
        }
        if self.allowed_node_collisions > 1024 {
            return Err(ParamsError::OutOfRange {
                msg: "allowed_node_collisions must be in 0..=1024",
            });
        }
        Ok(())
    }
}

/// Limits for one `go`: any combination of wall clock, visit and playout
/// budgets, plus an optional root-move restriction.
#[derive(Debug, Clone)]
pub struct SearchLimits<M> {
    pub time_ms: Option<i64>,
    /// Budget on `total_playouts + initial_visits`.
    pub visits: Option<i64>,
    /// Budget on playouts completed in this search alone.
    pub playouts: Option<i64>,
    pub infinite: bool,
    pub searchmoves: Vec<M>,
}

impl<M> Default for SearchLimits<M> {
    fn default() -> Self {
        Self {
            time_ms: None,
            visits: None,
            playouts: None,
            infinite: false,
            searchmoves: Vec::new(),
        }
    }
}
