use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHasher;

use crate::eval::{
    CachedEval, EvalCache, EvalError, Network, NetworkComputation, TranspositionCache,
    UniformNetwork,
};
use crate::info::BestMoveInfo;
use crate::node::EdgeRef;
use crate::params::{SearchLimits, SearchParams};
use crate::position::{Position, SearchMove};
use crate::search::Search;
use crate::tablebase::{ProbeState, Tablebase, WdlScore};
use crate::tree::NodeTree;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct ToyMove(u16);

impl SearchMove for ToyMove {
    fn nn_index(&self) -> u16 {
        self.0
    }

    fn uci(&self, _flip: bool) -> String {
        format!("m{}", self.0)
    }
}

/// A scripted game: every non-terminal position has `branching` moves, and
/// selected paths are terminal or rule-draw positions. Enough to exercise
/// the search core without a rules engine.
struct ToyRules {
    branching: u16,
    /// Paths of this length have no legal moves (treated as stalemate).
    max_depth: usize,
    /// Paths with no legal moves while in check.
    checkmates: Vec<Vec<u16>>,
    stalemate_root: bool,
    /// Paths where the halfmove clock reads 100.
    long_clock_paths: Vec<Vec<u16>>,
    /// Paths that repeat twice.
    repetition_paths: Vec<Vec<u16>>,
}

impl Default for ToyRules {
    fn default() -> Self {
        Self {
            branching: 4,
            max_depth: 60,
            checkmates: Vec::new(),
            stalemate_root: false,
            long_clock_paths: Vec::new(),
            repetition_paths: Vec::new(),
        }
    }
}

#[derive(Clone)]
struct ToyPosition {
    rules: Arc<ToyRules>,
    path: Vec<u16>,
}

impl ToyPosition {
    fn root(rules: ToyRules) -> Self {
        Self {
            rules: Arc::new(rules),
            path: Vec::new(),
        }
    }

    fn at(rules: ToyRules, path: Vec<u16>) -> Self {
        Self {
            rules: Arc::new(rules),
            path,
        }
    }

    fn no_moves_here(&self) -> bool {
        (self.rules.stalemate_root && self.path.is_empty())
            || self.path.len() >= self.rules.max_depth
            || self.rules.checkmates.iter().any(|p| p == &self.path)
    }
}

impl PartialEq for ToyPosition {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

fn toy_hash(path: &[u16]) -> u64 {
    let mut h = FxHasher::default();
    path.hash(&mut h);
    h.finish()
}

impl Position for ToyPosition {
    type Move = ToyMove;

    fn legal_moves(&self) -> Vec<ToyMove> {
        if self.no_moves_here() {
            Vec::new()
        } else {
            (0..self.rules.branching).map(ToyMove).collect()
        }
    }

    fn pseudolegal_move_indices(&self) -> Vec<u16> {
        (0..self.rules.branching).collect()
    }

    fn play(&self, mv: ToyMove) -> Self {
        let mut path = self.path.clone();
        path.push(mv.0);
        Self {
            rules: Arc::clone(&self.rules),
            path,
        }
    }

    fn is_under_check(&self) -> bool {
        self.rules.checkmates.iter().any(|p| p == &self.path)
    }

    fn has_mating_material(&self) -> bool {
        true
    }

    fn halfmove_clock(&self) -> u32 {
        if self.rules.long_clock_paths.iter().any(|p| p == &self.path) {
            100
        } else {
            0
        }
    }

    fn repetitions(&self) -> u32 {
        if self.rules.repetition_paths.iter().any(|p| p == &self.path) {
            2
        } else {
            0
        }
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
        4
    }

    fn hash_last(&self, _positions: usize) -> u64 {
        // The scripted game has no transpositions, so the path is the line.
        toy_hash(&self.path)
    }

    fn encode_for_eval(&self) -> Vec<f32> {
        let mut planes = Vec::with_capacity(self.path.len() + 1);
        planes.push(self.path.len() as f32);
        planes.extend(self.path.iter().map(|&m| m as f32));
        planes
    }
}

/// Scores lines under root move 0 at +0.9 for the root player and
/// everything else at -0.5, always reported from the side to move.
struct DominantNetwork;

struct DominantComputation {
    planes: Vec<Vec<f32>>,
}

impl NetworkComputation for DominantComputation {
    fn add_input(&mut self, planes: Vec<f32>) {
        self.planes.push(planes);
    }

    fn compute_blocking(&mut self) -> Result<(), EvalError> {
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.planes.len()
    }

    fn q(&self, idx: usize) -> f32 {
        let planes = &self.planes[idx];
        let len = planes[0] as usize;
        let white_view = if len >= 1 && planes[1] == 0.0 { 0.9 } else { -0.5 };
        if len % 2 == 0 {
            white_view
        } else {
            -white_view
        }
    }

    fn p(&self, _idx: usize, _move_index: u16) -> f32 {
        1.0
    }
}

impl Network for DominantNetwork {
    fn new_computation(&self) -> Box<dyn NetworkComputation> {
        Box::new(DominantComputation { planes: Vec::new() })
    }
}

/// Fails the batch if the evaluator is ever actually invoked.
struct FailingNetwork;

struct FailingComputation {
    inputs: usize,
}

impl NetworkComputation for FailingComputation {
    fn add_input(&mut self, _planes: Vec<f32>) {
        self.inputs += 1;
    }

    fn compute_blocking(&mut self) -> Result<(), EvalError> {
        Err(EvalError::Backend("unexpected evaluator call".into()))
    }

    fn batch_size(&self) -> usize {
        self.inputs
    }

    fn q(&self, _idx: usize) -> f32 {
        0.0
    }

    fn p(&self, _idx: usize, _move_index: u16) -> f32 {
        0.0
    }
}

impl Network for FailingNetwork {
    fn new_computation(&self) -> Box<dyn NetworkComputation> {
        Box::new(FailingComputation { inputs: 0 })
    }
}

struct SearchRun {
    tree: NodeTree<ToyPosition>,
    search: Arc<Search<ToyPosition>>,
    best_moves: Arc<Mutex<Vec<BestMoveInfo<ToyMove>>>>,
    infos: Arc<AtomicUsize>,
}

fn start_search(
    root: ToyPosition,
    network: Arc<dyn Network>,
    cache: Arc<TranspositionCache>,
    limits: SearchLimits<ToyMove>,
    params: SearchParams,
    tablebase: Option<Arc<dyn Tablebase<ToyPosition>>>,
) -> SearchRun {
    let tree = NodeTree::new(root);
    let best_moves = Arc::new(Mutex::new(Vec::new()));
    let infos = Arc::new(AtomicUsize::new(0));
    let bm = Arc::clone(&best_moves);
    let ic = Arc::clone(&infos);
    let search = Search::new(
        &tree,
        network,
        Box::new(move |info| bm.lock().push(info)),
        Box::new(move |_info| {
            ic.fetch_add(1, Ordering::SeqCst);
        }),
        limits,
        params,
        cache as Arc<dyn EvalCache>,
        tablebase,
    )
    .unwrap();
    SearchRun {
        tree,
        search,
        best_moves,
        infos,
    }
}

fn small_params() -> SearchParams {
    SearchParams {
        minibatch_size: 8,
        ..SearchParams::default()
    }
}

fn visits_limit(visits: i64) -> SearchLimits<ToyMove> {
    SearchLimits {
        visits: Some(visits),
        ..SearchLimits::default()
    }
}

fn root_child_visits(run: &SearchRun) -> Vec<u32> {
    let shared = run.tree.shared().read();
    let root = shared.tree.root();
    (0..shared.tree.num_edges(root))
        .map(|idx| shared.tree.edge_n(EdgeRef { node: root, idx }))
        .collect()
}

#[test]
fn single_thread_search_is_deterministic() {
    let run_once = || {
        let run = start_search(
            ToyPosition::root(ToyRules::default()),
            Arc::new(UniformNetwork),
            Arc::new(TranspositionCache::new(100_000)),
            visits_limit(400),
            small_params(),
            None,
        );
        run.search.run_blocking(1);
        (
            run.search.get_best_move().map(|b| b.bestmove),
            root_child_visits(&run),
        )
    };
    let (best_a, visits_a) = run_once();
    let (best_b, visits_b) = run_once();
    assert!(best_a.is_some());
    assert_eq!(best_a, best_b);
    assert_eq!(visits_a, visits_b);
}

#[test]
fn stalemate_root_is_a_terminal_draw() {
    let rules = ToyRules {
        stalemate_root: true,
        ..ToyRules::default()
    };
    let run = start_search(
        ToyPosition::root(rules),
        Arc::new(DominantNetwork),
        Arc::new(TranspositionCache::new(1024)),
        visits_limit(10),
        small_params(),
        None,
    );
    run.search.run_blocking(1);
    assert_eq!(run.search.get_best_eval(), 0.0);
    // No legal move exists, so no best-move report is produced.
    assert!(run.best_moves.lock().is_empty());
    assert!(run.search.stats().total_playouts > 0);
}

#[test]
fn sticky_checkmate_locks_onto_the_mating_move() {
    let rules = ToyRules {
        checkmates: vec![vec![2]],
        ..ToyRules::default()
    };
    let params = SearchParams {
        minibatch_size: 4,
        sticky_checkmate: true,
        ..SearchParams::default()
    };
    let run = start_search(
        ToyPosition::root(rules),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        visits_limit(200),
        params,
        None,
    );
    run.search.run_blocking(1);
    let best = run.search.get_best_move().unwrap();
    assert_eq!(best.bestmove, ToyMove(2));
    let visits = root_child_visits(&run);
    for (idx, &n) in visits.iter().enumerate() {
        if idx != 2 {
            assert!(visits[2] > n, "mate move starved: {:?}", visits);
        }
    }
}

#[test]
fn smart_pruning_stops_early_and_banks_bonus_time() {
    let params = SearchParams {
        minibatch_size: 4,
        ..SearchParams::default()
    };
    let limits = SearchLimits {
        time_ms: Some(1000),
        ..SearchLimits::default()
    };
    let run = start_search(
        ToyPosition::root(ToyRules::default()),
        Arc::new(DominantNetwork),
        Arc::new(TranspositionCache::new(200_000)),
        limits,
        params,
        None,
    );
    run.search.run_blocking(2);
    let best = run.search.get_best_move().unwrap();
    assert_eq!(best.bestmove, ToyMove(0));
    let bonus = run.search.bonus_time_saved();
    assert!(bonus > 0, "expected smart pruning to stop before the limit");
    assert_eq!(run.best_moves.lock().len(), 1);
}

#[test]
fn searchmoves_restricts_the_root() {
    let limits = SearchLimits {
        visits: Some(100),
        searchmoves: vec![ToyMove(1)],
        ..SearchLimits::default()
    };
    let run = start_search(
        ToyPosition::root(ToyRules::default()),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        limits,
        small_params(),
        None,
    );
    run.search.run_blocking(1);
    let best = run.search.get_best_move().unwrap();
    assert_eq!(best.bestmove, ToyMove(1));
    let visits = root_child_visits(&run);
    for (idx, &n) in visits.iter().enumerate() {
        if idx != 1 {
            assert_eq!(n, 0, "unrestricted move got visits: {:?}", visits);
        }
    }
}

fn prepopulate_cache(cache: &TranspositionCache, branching: u16, depth: usize) {
    let mut stack = vec![Vec::<u16>::new()];
    while let Some(path) = stack.pop() {
        cache.insert(
            toy_hash(&path),
            CachedEval {
                q: 0.0,
                p: (0..branching).map(|m| (m, 1.0 / branching as f32)).collect(),
            },
        );
        if path.len() < depth {
            for m in 0..branching {
                let mut next = path.clone();
                next.push(m);
                stack.push(next);
            }
        }
    }
}

#[test]
fn out_of_order_eval_runs_entirely_from_cache() {
    let rules = ToyRules {
        branching: 2,
        max_depth: 12,
        ..ToyRules::default()
    };
    let cache = Arc::new(TranspositionCache::new(100_000));
    prepopulate_cache(&cache, 2, 11);
    let params = SearchParams {
        minibatch_size: 4,
        out_of_order_eval: true,
        ..SearchParams::default()
    };
    let run = start_search(
        ToyPosition::root(rules),
        Arc::new(FailingNetwork),
        cache,
        visits_limit(40),
        params,
        None,
    );
    run.search.run_blocking(1);
    assert!(run.search.take_error().is_none());
    let shared = run.tree.shared().read();
    let root = shared.tree.root();
    assert!(shared.tree.node(root).n() > 0);
}

#[test]
fn evaluator_failure_aborts_the_search() {
    let run = start_search(
        ToyPosition::root(ToyRules::default()),
        Arc::new(FailingNetwork),
        Arc::new(TranspositionCache::new(1024)),
        visits_limit(10),
        small_params(),
        None,
    );
    run.search.run_blocking(1);
    assert!(run.search.take_error().is_some());
    assert!(!run.search.is_search_active());
}

#[test]
fn visit_limit_overshoot_is_bounded_by_one_batch() {
    let params = SearchParams {
        minibatch_size: 8,
        // Disable smart pruning so the limit itself is what stops us.
        futile_search_aversion: 0.0,
        ..SearchParams::default()
    };
    let run = start_search(
        ToyPosition::root(ToyRules::default()),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        visits_limit(100),
        params,
        None,
    );
    run.search.run_blocking(1);
    let stats = run.search.stats();
    assert!(stats.nodes >= 100, "stopped early: {:?}", stats);
    assert!(
        stats.nodes <= 100 + 8,
        "overshoot beyond one minibatch: {:?}",
        stats
    );
}

#[test]
fn rule_draw_shortcuts_fire_below_the_root_only() {
    let rules = ToyRules {
        branching: 2,
        long_clock_paths: vec![vec![], vec![1]],
        ..ToyRules::default()
    };
    let run = start_search(
        ToyPosition::root(rules),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        visits_limit(50),
        small_params(),
        None,
    );
    run.search.run_blocking(1);
    // The root's own 100-ply clock did not stop the search from producing
    // a move.
    assert!(run.search.get_best_move().is_some());
    let shared = run.tree.shared().read();
    let root = shared.tree.root();
    assert!(shared.tree.node(root).has_children());
    let child = shared
        .tree
        .edge_child(EdgeRef { node: root, idx: 1 })
        .unwrap();
    assert!(shared.tree.node(child).is_terminal());
    assert_eq!(shared.tree.node(child).q(), 0.0);
}

#[test]
fn repetition_draws_are_terminal() {
    let rules = ToyRules {
        branching: 2,
        repetition_paths: vec![vec![0]],
        ..ToyRules::default()
    };
    let run = start_search(
        ToyPosition::root(rules),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        visits_limit(50),
        small_params(),
        None,
    );
    run.search.run_blocking(1);
    let shared = run.tree.shared().read();
    let root = shared.tree.root();
    let child = shared
        .tree
        .edge_child(EdgeRef { node: root, idx: 0 })
        .unwrap();
    assert!(shared.tree.node(child).is_terminal());
    assert_eq!(shared.tree.node(child).q(), 0.0);
}

struct ToyTablebase;

impl Tablebase<ToyPosition> for ToyTablebase {
    fn max_cardinality(&self) -> u32 {
        5
    }

    fn probe_wdl(&self, pos: &ToyPosition) -> (WdlScore, ProbeState) {
        if pos.path == [0] {
            (WdlScore::Win, ProbeState::Ok)
        } else {
            (WdlScore::Draw, ProbeState::Fail)
        }
    }
}

#[test]
fn tablebase_win_becomes_a_terminal_and_counts_hits() {
    let rules = ToyRules {
        branching: 2,
        ..ToyRules::default()
    };
    let run = start_search(
        ToyPosition::root(rules),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        visits_limit(50),
        small_params(),
        Some(Arc::new(ToyTablebase) as Arc<dyn Tablebase<ToyPosition>>),
    );
    run.search.run_blocking(1);
    let stats = run.search.stats();
    assert!(stats.tb_hits >= 1);
    let shared = run.tree.shared().read();
    let root = shared.tree.root();
    let child = shared
        .tree
        .edge_child(EdgeRef { node: root, idx: 0 })
        .unwrap();
    assert!(shared.tree.node(child).is_terminal());
    // The side to move at the probed position wins, which reads as -1 from
    // the root player's perspective.
    assert_eq!(shared.tree.node(child).q(), -1.0);
}

#[test]
fn parallel_search_leaves_a_consistent_tree() {
    let rules = ToyRules {
        branching: 5,
        ..ToyRules::default()
    };
    let params = SearchParams {
        minibatch_size: 16,
        out_of_order_eval: true,
        noise: true,
        ..SearchParams::default()
    };
    let run = start_search(
        ToyPosition::root(rules),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(200_000)),
        visits_limit(3000),
        params,
        None,
    );
    run.search.run_blocking(4);

    let shared = run.tree.shared().read();
    let tree = &shared.tree;
    let root = tree.root();
    assert_eq!(tree.node(root).n() as u64, shared.total_playouts);

    for id in 0..tree.len() as u32 {
        let node = tree.node(id);
        assert_eq!(node.n_in_flight(), 0, "in-flight claim leaked on {}", id);

        if node.has_children() {
            let mut child_sum = 0u64;
            let mut prior_sum = 0.0f32;
            for idx in 0..tree.num_edges(id) {
                let edge = EdgeRef { node: id, idx };
                child_sum += tree.edge_n(edge) as u64;
                prior_sum += tree.edge_p(edge);
            }
            assert!(
                child_sum <= node.n() as u64,
                "children outvisited parent {}: {} > {}",
                id,
                child_sum,
                node.n()
            );
            if prior_sum > 0.0 {
                assert!(
                    (prior_sum - 1.0).abs() < 1e-3,
                    "priors of {} sum to {}",
                    id,
                    prior_sum
                );
            }
        }
    }
}

#[test]
fn fresh_tree_children_visits_add_up() {
    let run = start_search(
        ToyPosition::root(ToyRules::default()),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        visits_limit(200),
        small_params(),
        None,
    );
    run.search.run_blocking(1);
    let shared = run.tree.shared().read();
    let root = shared.tree.root();
    let child_sum: u32 = (0..shared.tree.num_edges(root))
        .map(|idx| shared.tree.edge_n(EdgeRef { node: root, idx }))
        .sum();
    // The first playout terminated at the root itself.
    assert_eq!(child_sum, shared.tree.node(root).n() - 1);
}

#[test]
fn best_move_is_the_lexicographic_max_of_n_q_p() {
    let run = start_search(
        ToyPosition::root(ToyRules::default()),
        Arc::new(DominantNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        visits_limit(300),
        small_params(),
        None,
    );
    run.search.run_blocking(2);
    let best = run.search.get_best_move().unwrap().bestmove;

    let shared = run.tree.shared().read();
    let root = shared.tree.root();
    let expected = (0..shared.tree.num_edges(root))
        .map(|idx| EdgeRef { node: root, idx })
        .max_by(|&a, &b| {
            let ka = (
                shared.tree.edge_n(a),
                shared.tree.edge_q(a, -10.0),
                shared.tree.edge_p(a),
            );
            let kb = (
                shared.tree.edge_n(b),
                shared.tree.edge_q(b, -10.0),
                shared.tree.edge_p(b),
            );
            ka.partial_cmp(&kb).unwrap()
        })
        .unwrap();
    assert_eq!(best, shared.tree.edge_move(expected));
}

#[test]
fn decayed_temperature_falls_back_to_no_temperature() {
    let rules = ToyRules::default();
    let base = ToyPosition::at(rules, vec![0, 0]);
    let params = SearchParams {
        minibatch_size: 8,
        temperature: 5.0,
        temp_decay_moves: 1,
        ..SearchParams::default()
    };
    let run = start_search(
        base,
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        visits_limit(200),
        params,
        None,
    );
    run.search.run_blocking(1);
    // game_ply = 2 means one full move played, so the temperature has
    // decayed to zero and selection is the deterministic visit-count max.
    let best = run.search.get_best_move().unwrap().bestmove;
    let shared = run.tree.shared().read();
    let root = shared.tree.root();
    let expected = (0..shared.tree.num_edges(root))
        .map(|idx| EdgeRef { node: root, idx })
        .max_by(|&a, &b| {
            let ka = (
                shared.tree.edge_n(a),
                shared.tree.edge_q(a, -10.0),
                shared.tree.edge_p(a),
            );
            let kb = (
                shared.tree.edge_n(b),
                shared.tree.edge_q(b, -10.0),
                shared.tree.edge_p(b),
            );
            ka.partial_cmp(&kb).unwrap()
        })
        .unwrap();
    assert_eq!(best, shared.tree.edge_move(expected));
}

#[test]
fn stop_reports_a_best_move_and_abort_does_not() {
    let infinite = SearchLimits {
        infinite: true,
        ..SearchLimits::default()
    };
    let run = start_search(
        ToyPosition::root(ToyRules::default()),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        infinite.clone(),
        small_params(),
        None,
    );
    run.search.start_threads(2);
    std::thread::sleep(std::time::Duration::from_millis(100));
    run.search.stop();
    run.search.wait();
    assert_eq!(run.best_moves.lock().len(), 1);
    assert!(run.infos.load(Ordering::SeqCst) >= 1);
    assert!(!run.search.is_search_active());

    let run = start_search(
        ToyPosition::root(ToyRules::default()),
        Arc::new(UniformNetwork),
        Arc::new(TranspositionCache::new(100_000)),
        infinite,
        small_params(),
        None,
    );
    run.search.start_threads(2);
    std::thread::sleep(std::time::Duration::from_millis(50));
    run.search.abort();
    run.search.wait();
    assert!(run.best_moves.lock().is_empty());
}

#[test]
fn tree_reuse_promotes_the_played_subtree() {
    let mut tree = NodeTree::new(ToyPosition::root(ToyRules::default()));
    let best_moves: Arc<Mutex<Vec<BestMoveInfo<ToyMove>>>> = Arc::new(Mutex::new(Vec::new()));
    let bm = Arc::clone(&best_moves);
    let search = Search::new(
        &tree,
        Arc::new(UniformNetwork),
        Box::new(move |info| bm.lock().push(info)),
        Box::new(|_| {}),
        visits_limit(300),
        small_params(),
        Arc::new(TranspositionCache::new(100_000)) as Arc<dyn EvalCache>,
        None,
    )
    .unwrap();
    search.run_blocking(1);
    let played = search.get_best_move().unwrap().bestmove;
    let child_n = {
        let shared = tree.shared().read();
        let root = shared.tree.root();
        let idx = shared.tree.find_edge(root, played).unwrap();
        shared.tree.edge_n(EdgeRef { node: root, idx })
    };
    drop(search);

    let before = tree.node_count();
    tree.make_move(played);
    assert!(tree.node_count() < before);
    {
        let shared = tree.shared().read();
        let root = shared.tree.root();
        assert_eq!(shared.tree.node(root).n(), child_n);
    }
    assert_eq!(tree.head_position().game_ply(), 1);

    // A different base forgets everything.
    tree.reset_to(ToyPosition::root(ToyRules { branching: 2, ..ToyRules::default() }), &[]);
    assert_eq!(tree.node_count(), 1);
}
