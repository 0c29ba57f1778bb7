//! End-to-end engine flow: set a position, go, receive a best move,
//! reuse the tree, and check bonus banking plumbing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use cz_engine::{EngineConfig, EngineController, EngineError, GoParams};
use cz_logging::NdjsonWriter;
use cz_mcts::{
    BestMoveInfo, EvalCache, Position, SearchMove, SearchParams, TranspositionCache,
    UniformNetwork,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Mv(u16);

impl SearchMove for Mv {
    fn nn_index(&self) -> u16 {
        self.0
    }

    fn uci(&self, _flip: bool) -> String {
        format!("m{}", self.0)
    }
}

/// Three moves everywhere, games end after 40 plies.
#[derive(Clone, PartialEq)]
struct Pos {
    path: Vec<u16>,
}

impl Pos {
    fn start() -> Self {
        Self { path: Vec::new() }
    }
}

impl Position for Pos {
    type Move = Mv;

    fn legal_moves(&self) -> Vec<Mv> {
        if self.path.len() >= 40 {
            Vec::new()
        } else {
            (0..3).map(Mv).collect()
        }
    }

    fn pseudolegal_move_indices(&self) -> Vec<u16> {
        (0..3).collect()
    }

    fn play(&self, mv: Mv) -> Self {
        let mut path = self.path.clone();
        path.push(mv.0);
        Self { path }
    }

    fn is_under_check(&self) -> bool {
        false
    }

    fn has_mating_material(&self) -> bool {
        true
    }

    fn halfmove_clock(&self) -> u32 {
        0
    }

    fn repetitions(&self) -> u32 {
        0
    }

    fn game_ply(&self) -> u32 {
        self.path.len() as u32
    }

    fn is_black_to_move(&self) -> bool {
        self.path.len() % 2 == 1
    }

    fn may_castle(&self) -> bool {
        false
    }

    fn piece_count(&self) -> u32 {
        32
    }

    fn hash_last(&self, _positions: usize) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.path.hash(&mut h);
        h.finish()
    }

    fn encode_for_eval(&self) -> Vec<f32> {
        vec![self.path.len() as f32]
    }
}

struct Handlers {
    best_moves: Arc<Mutex<Vec<BestMoveInfo<Mv>>>>,
    infos: Arc<AtomicUsize>,
}

fn engine(config: EngineConfig) -> (EngineController<Pos>, Handlers) {
    let best_moves: Arc<Mutex<Vec<BestMoveInfo<Mv>>>> = Arc::new(Mutex::new(Vec::new()));
    let infos = Arc::new(AtomicUsize::new(0));
    let bm = Arc::clone(&best_moves);
    let ic = Arc::clone(&infos);
    let controller = EngineController::new(
        config,
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::default()) as Arc<dyn EvalCache>,
        None,
        Arc::new(move |best| bm.lock().push(best)),
        Arc::new(move |_info| {
            ic.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();
    (controller, Handlers { best_moves, infos })
}

fn small_config() -> EngineConfig {
    EngineConfig {
        threads: 2,
        search: SearchParams {
            minibatch_size: 8,
            // Keep node budgets exact; smart pruning is covered elsewhere.
            futile_search_aversion: 0.0,
            ..SearchParams::default()
        },
        ..EngineConfig::default()
    }
}

#[test]
fn go_without_position_is_an_error() {
    let (mut controller, _handlers) = engine(small_config());
    let err = controller.go(&GoParams::default()).unwrap_err();
    assert!(matches!(err, EngineError::NoPosition));
}

#[test]
fn go_with_node_budget_reports_one_best_move() {
    let (mut controller, handlers) = engine(small_config());
    controller.set_position(Pos::start(), &[]);
    controller
        .go(&GoParams {
            nodes: Some(300),
            ..GoParams::default()
        })
        .unwrap();
    controller.search().unwrap().wait();

    assert_eq!(handlers.best_moves.lock().len(), 1);
    assert!(handlers.infos.load(Ordering::SeqCst) >= 1);
    assert!(!controller.is_search_active());

    // A second go on the same game works and reuses the engine state.
    controller
        .go(&GoParams {
            nodes: Some(100),
            ..GoParams::default()
        })
        .unwrap();
    controller.search().unwrap().wait();
    assert_eq!(handlers.best_moves.lock().len(), 2);
}

#[test]
fn played_moves_keep_the_searched_subtree() {
    let (mut controller, handlers) = engine(small_config());
    controller.set_position(Pos::start(), &[]);
    controller
        .go(&GoParams {
            nodes: Some(300),
            ..GoParams::default()
        })
        .unwrap();
    controller.search().unwrap().wait();
    let played = handlers.best_moves.lock()[0].bestmove;

    // Continue the same line; the tree re-roots instead of restarting.
    controller.set_position(Pos::start(), &[played]);
    controller
        .go(&GoParams {
            nodes: Some(300),
            ..GoParams::default()
        })
        .unwrap();
    controller.search().unwrap().wait();
    assert_eq!(handlers.best_moves.lock().len(), 2);
}

#[test]
fn abort_suppresses_the_best_move() {
    let (mut controller, handlers) = engine(small_config());
    controller.set_position(Pos::start(), &[]);
    controller
        .go(&GoParams {
            infinite: true,
            ..GoParams::default()
        })
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));
    let search = Arc::clone(controller.search().unwrap());
    search.abort();
    search.wait();
    assert!(handlers.best_moves.lock().is_empty());
}

#[test]
fn new_game_clears_bonus_and_tree() {
    let (mut controller, _handlers) = engine(small_config());
    controller.set_position(Pos::start(), &[]);
    controller.new_game();
    assert_eq!(controller.time_manager().bonus_ms(), 0);
    // The position is gone after a new game.
    assert!(matches!(
        controller.go(&GoParams::default()),
        Err(EngineError::NoPosition)
    ));
}

#[test]
fn search_summaries_land_in_the_ndjson_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("search.ndjson");

    let (mut controller, _handlers) = engine(small_config());
    controller.set_search_log(NdjsonWriter::open_append(&log_path).unwrap());
    controller.set_position(Pos::start(), &[]);
    controller
        .go(&GoParams {
            nodes: Some(200),
            ..GoParams::default()
        })
        .unwrap();
    controller.search().unwrap().wait();
    // Retiring the search (here via stop-for-next-position) writes the
    // summary for the finished one.
    controller.set_position(Pos::start(), &[Mv(0)]);

    let contents = std::fs::read_to_string(&log_path).unwrap();
    let line = contents.lines().next().expect("one summary line");
    let value: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(value["event"], "search_summary");
    assert_eq!(value["game_ply"], 0);
    assert!(value["nodes"].as_u64().unwrap() >= 200);
    assert!(value["bestmove"].as_str().unwrap().starts_with('m'));
}
