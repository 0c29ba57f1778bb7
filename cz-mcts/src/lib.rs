//! Tree-parallel PUCT search core for an AlphaZero-style chess engine.
//!
//! The crate owns the game tree, the selection / expansion / batched
//! evaluation / backup pipeline, and the search controller with its worker
//! and watchdog threads. Chess rules, the neural evaluator, the evaluation
//! cache, and endgame tablebases are capability traits supplied by the
//! embedding engine:
//! - [`Position`] / [`SearchMove`] for the rules engine
//! - [`Network`] / [`NetworkComputation`] for the evaluator
//! - [`EvalCache`] for the shared evaluation cache
//! - [`Tablebase`] for WDL probing

pub mod batch;
pub mod eval;
pub mod info;
pub mod node;
pub mod params;
pub mod position;
pub mod search;
pub mod tablebase;
pub mod tree;

mod worker;

pub use batch::CachingComputation;
pub use eval::{
    CachedEval, EvalCache, EvalError, Network, NetworkComputation, TranspositionCache,
    UniformNetwork,
};
pub use info::{BestMoveInfo, ThinkingInfo};
pub use node::{EdgeRef, NodeId, Outcome};
pub use params::{ParamsError, SearchLimits, SearchParams};
pub use position::{Position, SearchMove};
pub use search::{Search, SearchError, SearchStats};
pub use tablebase::{ProbeState, Tablebase, WdlScore};
pub use tree::NodeTree;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");


#[cfg(test)]
mod search_tests;
