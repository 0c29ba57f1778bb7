//! Per-move time budgeting with a survival-curve horizon estimate.

use serde::{Deserialize, Serialize};

use cz_mcts::SearchLimits;

use crate::ConfigError;

// Smart pruning can only win back budgets larger than this, so smaller
// budgets are never extended by slowmover.
const SMART_PRUNING_TOLERANCE_MS: f32 = 200.0;

/// External "go" parameters, as handed over by the protocol layer.
#[derive(Debug, Clone)]
pub struct GoParams<M> {
    pub wtime: Option<i64>,
    pub btime: Option<i64>,
    pub winc: Option<i64>,
    pub binc: Option<i64>,
    pub movestogo: Option<i64>,
    pub movetime: Option<i64>,
    pub nodes: Option<i64>,
    pub infinite: bool,
    pub ponder: bool,
    pub searchmoves: Vec<M>,
}

impl<M> Default for GoParams<M> {
    fn default() -> Self {
        Self {
            wtime: None,
            btime: None,
            winc: None,
            binc: None,
            movestogo: None,
            movetime: None,
            nodes: None,
            infinite: false,
            ponder: false,
            searchmoves: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// Thinking time scale factor.
    pub slowmover: f32,
    /// Per-move communication overhead, milliseconds.
    pub move_overhead_ms: i64,
    /// Ply where the survival curve is at half its maximum.
    pub time_curve_midpoint: f32,
    /// How quickly the survival curve drops off.
    pub time_curve_steepness: f32,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            slowmover: 1.0,
            move_overhead_ms: 100,
            time_curve_midpoint: 101.5,
            time_curve_steepness: 6.8,
        }
    }
}

impl TimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.slowmover.is_finite() && (0.0..=100.0).contains(&self.slowmover)) {
            return Err(ConfigError::Invalid {
                msg: "slowmover must be in 0..=100",
            });
        }
        if !(0..=10_000).contains(&self.move_overhead_ms) {
            return Err(ConfigError::Invalid {
                msg: "move_overhead_ms must be in 0..=10000",
            });
        }
        if !(self.time_curve_midpoint.is_finite()
            && (1.0..=200.0).contains(&self.time_curve_midpoint))
        {
            return Err(ConfigError::Invalid {
                msg: "time_curve_midpoint must be in 1..=200",
            });
        }
        if !(self.time_curve_steepness.is_finite()
            && (1.0..=100.0).contains(&self.time_curve_steepness))
        {
            return Err(ConfigError::Invalid {
                msg: "time_curve_steepness must be in 1..=100",
            });
        }
        Ok(())
    }
}

// Survival function of the logistic distribution; it fits the empirical
// P(game still running at ply).
fn survival_at_ply(ply: f32, midpoint: f32, steepness: f32) -> f32 {
    1.0 / (1.0 + (ply / midpoint).powf(steepness))
}

/// Per-engine time state: the configuration plus the bonus bank that smart
/// pruning feeds and the next real decision drains.
pub struct TimeManager {
    config: TimeConfig,
    bonus_ms: i64,
}

impl TimeManager {
    pub fn new(config: TimeConfig) -> Self {
        Self {
            config,
            bonus_ms: 0,
        }
    }

    /// Save time a smart-pruned search left unspent.
    pub fn bank_bonus(&mut self, ms: i64) {
        if ms > 0 {
            self.bonus_ms += ms;
        }
    }

    pub fn bonus_ms(&self) -> i64 {
        self.bonus_ms
    }

    pub fn clear_bonus(&mut self) {
        self.bonus_ms = 0;
    }

    /// Expected number of own moves left in the game, from summing the
    /// survival curve ahead of `ply`.
    pub fn guessed_moves_to_go(&self, ply: u32) -> f32 {
        let midpoint = self.config.time_curve_midpoint;
        let steepness = self.config.time_curve_steepness;
        // All values are scaled relative to the survival at the current ply.
        let this_move_survival = survival_at_ply(ply as f32, midpoint, steepness);
        let mut sum = 0.0f32;
        let mut p = ply + 2;
        // A wide range of plies approximates summing to infinity.
        while p < ply + 300 {
            sum += survival_at_ply(p as f32, midpoint, steepness);
            p += 2;
        }
        sum / this_move_survival + 1.0
    }

    /// Translate go parameters into search limits, computing the per-move
    /// think budget from the clock. Banked bonus time is consumed here,
    /// exactly once.
    pub fn limits_for<M: Clone>(
        &mut self,
        ply: u32,
        is_black: bool,
        go: &GoParams<M>,
    ) -> SearchLimits<M> {
        let mut limits = SearchLimits {
            time_ms: go.movetime,
            searchmoves: go.searchmoves.clone(),
            infinite: go.infinite || go.ponder,
            ..SearchLimits::default()
        };
        if !limits.infinite {
            limits.visits = go.nodes;
        }
        let time = if is_black { go.btime } else { go.wtime };
        let time = match time {
            Some(t) if !limits.infinite => t,
            _ => return limits,
        };
        let increment = if is_black { go.binc } else { go.winc }
            .unwrap_or(0)
            .max(0);

        // movestogo == 0 is a non-standard way of saying "this move only".
        let mut movestogo = match go.movestogo {
            None => -1.0f32,
            Some(0) => 1.0,
            Some(m) => m as f32,
        };
        let guessed = self.guessed_moves_to_go(ply);
        // A nearer clock-mandated horizon wins, so all the time until the
        // time control gets used.
        if movestogo <= 0.0 || guessed < movestogo {
            movestogo = guessed;
        }

        // Total time, including increments, until the time control.
        let mut total = (time as f32 + increment as f32 * (movestogo - 1.0)
            - self.config.move_overhead_ms as f32)
            .max(0.0);

        // The curve itself is computed without the banked bonus.
        if self.bonus_ms > 0 {
            total -= self.bonus_ms as f32;
        }
        let mut this_move = total / movestogo;

        // Only extend with slowmover where smart pruning could win the
        // extension back.
        if self.config.slowmover < 1.0
            || this_move * self.config.slowmover > SMART_PRUNING_TOLERANCE_MS
        {
            this_move *= self.config.slowmover;
        }

        // Spend the banked time now, at a real decision.
        if self.bonus_ms > 0 {
            this_move += self.bonus_ms as f32;
            self.bonus_ms = 0;
        }

        limits.time_ms = Some(
            (this_move as i64)
                .min(time - self.config.move_overhead_ms)
                .max(0),
        );
        limits
    }
}
