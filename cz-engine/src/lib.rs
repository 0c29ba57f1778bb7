//! Engine controller: position lifecycle, per-move time budgets, and
//! search management around the `cz-mcts` core.

pub mod time;


use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cz_logging::{NdjsonWriter, SearchSummaryEventV1};
use cz_mcts::{
    BestMoveInfo, EvalCache, Network, NodeTree, ParamsError, Position, Search, SearchMove,
    SearchParams, Tablebase, ThinkingInfo,
};

pub use time::{GoParams, TimeConfig, TimeManager};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid option: {msg}")]
    Invalid { msg: &'static str },
    #[error(transparent)]
    Params(#[from] ParamsError),
}

/// Engine configuration, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads per search.
    pub threads: usize,
    /// Evaluation cache capacity, in entries.
    pub cache_size: usize,
    pub time: TimeConfig,
    pub search: SearchParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            cache_size: 200_000,
            time: TimeConfig::default(),
            search: SearchParams::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=128).contains(&self.threads) {
            return Err(ConfigError::Invalid {
                msg: "threads must be in 1..=128",
            });
        }
        self.time.validate()?;
        self.search.validate()?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no position has been set")]
    NoPosition,
    #[error(transparent)]
    Params(#[from] ParamsError),
}

pub type BestMoveHandler<M> = Arc<dyn Fn(BestMoveInfo<M>) + Send + Sync>;
pub type InfoHandler = Arc<dyn Fn(&ThinkingInfo) + Send + Sync>;

/// Owns the tree, the collaborators, and the time manager across the moves
/// of a game; spawns one `Search` per `go`.
pub struct EngineController<P: Position> {
    config: EngineConfig,
    network: Arc<dyn Network>,
    cache: Arc<dyn EvalCache>,
    tablebase: Option<Arc<dyn Tablebase<P>>>,
    tree: Option<NodeTree<P>>,
    search: Option<Arc<Search<P>>>,
    time_manager: TimeManager,
    best_move_handler: BestMoveHandler<P::Move>,
    info_handler: InfoHandler,
    search_log: Option<NdjsonWriter>,
}

impl<P: Position> EngineController<P> {
    pub fn new(
        config: EngineConfig,
        network: Arc<dyn Network>,
        cache: Arc<dyn EvalCache>,
        tablebase: Option<Arc<dyn Tablebase<P>>>,
        best_move_handler: BestMoveHandler<P::Move>,
        info_handler: InfoHandler,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        cache.set_capacity(config.cache_size);
        let time_manager = TimeManager::new(config.time);
        Ok(Self {
            config,
            network,
            cache,
            tablebase,
            tree: None,
            search: None,
            time_manager,
            best_move_handler,
            info_handler,
            search_log: None,
        })
    }

    /// Route per-move search summaries to an NDJSON log.
    pub fn set_search_log(&mut self, writer: NdjsonWriter) {
        self.search_log = Some(writer);
    }

    pub fn time_manager(&self) -> &TimeManager {
        &self.time_manager
    }

    pub fn search(&self) -> Option<&Arc<Search<P>>> {
        self.search.as_ref()
    }

    pub fn is_search_active(&self) -> bool {
        self.search.as_ref().map_or(false, |s| s.is_search_active())
    }

    /// Forget the game: cache, tree, and any banked bonus time.
    pub fn new_game(&mut self) {
        let _ = self.retire_search();
        self.time_manager.clear_bonus();
        self.cache.clear();
        self.tree = None;
    }

    /// Point the engine at `base` with `moves` applied; the searched
    /// subtree survives when the new position extends the current line.
    pub fn set_position(&mut self, base: P, moves: &[P::Move]) {
        let bonus = self.retire_search();
        self.time_manager.bank_bonus(bonus);
        let tree = self
            .tree
            .get_or_insert_with(|| NodeTree::new(base.clone()));
        tree.reset_to(base, moves);
    }

    /// Start a search for the current position with a budget derived from
    /// the go parameters. Any bonus from the previous search is banked
    /// before the budget is computed.
    pub fn go(&mut self, go: &GoParams<P::Move>) -> Result<(), EngineError> {
        let bonus = self.retire_search();
        self.time_manager.bank_bonus(bonus);

        let tree = self.tree.as_ref().ok_or(EngineError::NoPosition)?;
        let head = tree.head_position();
        let limits = self
            .time_manager
            .limits_for(head.game_ply(), head.is_black_to_move(), go);

        let best_move_handler = Arc::clone(&self.best_move_handler);
        let info_handler = Arc::clone(&self.info_handler);
        let search = Search::new(
            tree,
            Arc::clone(&self.network),
            Box::new(move |best| best_move_handler(best)),
            Box::new(move |info| info_handler(info)),
            limits,
            self.config.search,
            Arc::clone(&self.cache),
            self.tablebase.clone(),
        )?;
        search.start_threads(self.config.threads);
        self.search = Some(search);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(search) = &self.search {
            search.stop();
            search.wait();
        }
    }

    /// Stop, join, and drop the current search. Returns the bonus time it
    /// saved (zero if none); logs a summary if a log is attached.
    fn retire_search(&mut self) -> i64 {
        let Some(search) = self.search.take() else {
            return 0;
        };
        search.stop();
        search.wait();
        let bonus = search.bonus_time_saved();
        if let Some(log) = &mut self.search_log {
            if let Some(best) = search.get_best_move() {
                let stats = search.stats();
                let flip = search.root_is_black();
                let event = SearchSummaryEventV1 {
                    event: SearchSummaryEventV1::EVENT,
                    ts_ms: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64,
                    engine_version: VERSION,
                    game_ply: search.root_game_ply(),
                    bestmove: best.bestmove.uci(flip),
                    ponder: best.ponder.map(|m| m.uci(!flip)),
                    nodes: stats.nodes,
                    nps: if stats.elapsed_ms > 0 {
                        stats.total_playouts * 1000 / stats.elapsed_ms as u64
                    } else {
                        0
                    },
                    depth: stats.avg_depth,
                    seldepth: stats.max_depth,
                    time_ms: stats.elapsed_ms,
                    tb_hits: stats.tb_hits,
                    bonus_banked_ms: bonus,
                };
                let _ = log.write_event(&event);
                let _ = log.flush();
            }
        }
        bonus
    }
}
