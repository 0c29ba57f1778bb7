//! Search controller: shared state, stop conditions, best-move tracking,
//! info emission, smart pruning, and thread lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::eval::{EvalCache, EvalError, Network};
use crate::info::{BestMoveInfo, ThinkingInfo};
use crate::node::{EdgeRef, InfoMark, NodeId, SharedTree};
use crate::params::{ParamsError, SearchLimits, SearchParams};
use crate::position::{Position, SearchMove};
use crate::tablebase::Tablebase;
use crate::tree::NodeTree;
use crate::worker::SearchWorker;

pub(crate) const SMART_PRUNING_TOLERANCE_NODES: i64 = 100;
pub(crate) const SMART_PRUNING_TOLERANCE_MS: i64 = 200;
// Maximum delay between info emissions when nothing interesting happens.
const UCI_INFO_MINIMUM_FREQUENCY_MS: i64 = 5000;

const WATCHDOG_MAX_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Eval(#[from] EvalError),
}

pub type BestMoveCallback<M> = Box<dyn Fn(BestMoveInfo<M>) + Send + Sync>;
pub type InfoCallback = Box<dyn Fn(&ThinkingInfo) + Send + Sync>;

/// Reported centipawn score for a mean value in `[-1, 1]`.
pub fn q_to_centipawns(q: f32) -> i32 {
    (290.680623072 * (1.548090806 * q as f64).tan()) as i32
}

/// Progress snapshot for logging and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchStats {
    pub total_playouts: u64,
    pub nodes: u64,
    pub avg_depth: u32,
    pub max_depth: u32,
    pub tb_hits: u64,
    pub elapsed_ms: i64,
}

struct Counters<M> {
    stop: bool,
    responded_bestmove: bool,
    found_best_move: bool,
    best_move: Option<BestMoveInfo<M>>,
    bonus_time_ms: i64,
}

impl<M> Default for Counters<M> {
    fn default() -> Self {
        Self {
            stop: false,
            responded_bestmove: false,
            found_best_move: false,
            best_move: None,
            bonus_time_ms: 0,
        }
    }
}

/// One search over the current tree head. Construct per `go`, start worker
/// threads, and either wait or stop/abort from another thread.
pub struct Search<P: Position> {
    pub(crate) params: SearchParams,
    pub(crate) limits: SearchLimits<P::Move>,
    pub(crate) shared: Arc<RwLock<SharedTree<P::Move>>>,
    pub(crate) root: NodeId,
    pub(crate) root_position: P,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) cache: Arc<dyn EvalCache>,
    pub(crate) tablebase: Option<Arc<dyn Tablebase<P>>>,
    start_time: Instant,
    initial_visits: u32,
    pub(crate) tb_hits: AtomicU64,
    counters: Mutex<Counters<P::Move>>,
    watchdog_cv: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
    best_move_callback: BestMoveCallback<P::Move>,
    info_callback: InfoCallback,
    rng: Mutex<ChaCha8Rng>,
    error: Mutex<Option<SearchError>>,
    // Handle to hand worker threads an owning reference to this search.
    weak_self: Mutex<Weak<Self>>,
}

impl<P: Position> Search<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: &NodeTree<P>,
        network: Arc<dyn Network>,
        best_move_callback: BestMoveCallback<P::Move>,
        info_callback: InfoCallback,
        limits: SearchLimits<P::Move>,
        params: SearchParams,
        cache: Arc<dyn EvalCache>,
        tablebase: Option<Arc<dyn Tablebase<P>>>,
    ) -> Result<Arc<Self>, ParamsError> {
        params.validate()?;
        let shared = Arc::clone(tree.shared());
        let (root, initial_visits) = {
            let mut s = shared.write();
            s.reset_search_progress();
            let root = s.tree.root();
            (root, s.tree.node(root).n())
        };
        let search = Arc::new(Self {
            params,
            limits,
            shared,
            root,
            root_position: tree.head_position().clone(),
            network,
            cache,
            tablebase,
            start_time: Instant::now(),
            initial_visits,
            tb_hits: AtomicU64::new(0),
            counters: Mutex::new(Counters::default()),
            watchdog_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            best_move_callback,
            info_callback,
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
            error: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
        });
        *search.weak_self.lock() = Arc::downgrade(&search);
        Ok(search)
    }

    /// Start `how_many` worker threads plus the watchdog (the watchdog is
    /// always the first thread).
    pub fn start_threads(&self, how_many: usize) {
        let Some(this) = self.weak_self.lock().upgrade() else {
            return;
        };
        let mut threads = self.threads.lock();
        if threads.is_empty() {
            let search = Arc::clone(&this);
            threads.push(std::thread::spawn(move || search.watchdog_loop()));
        }
        while threads.len() <= how_many {
            let search = Arc::clone(&this);
            threads.push(std::thread::spawn(move || {
                SearchWorker::new(search).run_blocking();
            }));
        }
    }

    pub fn run_blocking(&self, threads: usize) {
        self.start_threads(threads);
        self.wait();
    }

    pub fn is_search_active(&self) -> bool {
        !self.counters.lock().stop
    }

    /// Request a graceful stop; a best move is still reported.
    pub fn stop(&self) {
        self.counters.lock().stop = true;
        self.watchdog_cv.notify_all();
    }

    /// Stop and suppress the best-move report.
    pub fn abort(&self) {
        let mut c = self.counters.lock();
        c.responded_bestmove = true;
        c.stop = true;
        drop(c);
        self.watchdog_cv.notify_all();
    }

    pub fn wait(&self) {
        let mut threads = self.threads.lock();
        while let Some(handle) = threads.pop() {
            let _ = handle.join();
        }
    }

    /// A fatal evaluator error, if one aborted the search.
    pub fn take_error(&self) -> Option<SearchError> {
        self.error.lock().take()
    }

    /// Time banked by smart pruning, to be spent on the next real decision.
    pub fn bonus_time_saved(&self) -> i64 {
        self.counters.lock().bonus_time_ms
    }

    pub fn root_game_ply(&self) -> u32 {
        self.root_position.game_ply()
    }

    pub fn root_is_black(&self) -> bool {
        self.root_position.is_black_to_move()
    }

    pub fn stats(&self) -> SearchStats {
        let shared = self.shared.read();
        SearchStats {
            total_playouts: shared.total_playouts,
            nodes: shared.total_playouts + self.initial_visits as u64,
            avg_depth: (shared.cum_depth / shared.total_playouts.max(1)) as u32,
            max_depth: shared.max_depth as u32,
            tb_hits: self.tb_hits.load(Ordering::Acquire),
            elapsed_ms: self.elapsed_ms(),
        }
    }

    /// The best move and ponder move under the current temperature settings.
    pub fn get_best_move(&self) -> Option<BestMoveInfo<P::Move>> {
        let shared = self.shared.read();
        let counters = self.counters.lock();
        self.best_move_internal(&shared, &counters)
    }

    /// Evaluation of the actual best child, ignoring temperature.
    pub fn get_best_eval(&self) -> f32 {
        let shared = self.shared.read();
        let parent_q = -shared.tree.node(self.root).q();
        if !shared.tree.node(self.root).has_children() {
            return parent_q;
        }
        match self.best_child_no_temperature(&shared, self.root) {
            Some(edge) => shared.tree.edge_q(edge, parent_q),
            None => parent_q,
        }
    }

    pub(crate) fn elapsed_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    pub(crate) fn record_error(&self, err: SearchError) {
        *self.error.lock() = Some(err);
        self.stop();
    }

    pub(crate) fn set_found_best_move(&self) {
        self.counters.lock().found_best_move = true;
    }

    fn watchdog_loop(&self) {
        while self.is_search_active() {
            {
                let mut counters = self.counters.lock();
                let wait = match self.limits.time_ms {
                    Some(t) => {
                        let remaining = (t - self.elapsed_ms()).max(0) as u64;
                        Duration::from_millis(remaining).min(WATCHDOG_MAX_WAIT)
                    }
                    None => WATCHDOG_MAX_WAIT,
                };
                if !counters.stop {
                    let _ = self.watchdog_cv.wait_for(&mut counters, wait);
                }
            }
            self.maybe_trigger_stop();
        }
        self.maybe_trigger_stop();
    }

    /// Check limits and the smart-pruning flag; on the first transition to
    /// stopped, emit final info and the best-move report and bank any time
    /// smart pruning saved.
    pub(crate) fn maybe_trigger_stop(&self) {
        let mut shared = self.shared.write();
        let mut counters = self.counters.lock();
        if counters.responded_bestmove {
            return;
        }
        // Don't stop when the root node is not yet expanded.
        if shared.total_playouts == 0 {
            return;
        }
        if counters.found_best_move {
            counters.stop = true;
        }
        if let Some(playouts) = self.limits.playouts {
            if shared.total_playouts as i64 >= playouts {
                counters.stop = true;
            }
        }
        if let Some(visits) = self.limits.visits {
            if (shared.total_playouts + self.initial_visits as u64) as i64 >= visits {
                counters.stop = true;
            }
        }
        if let Some(time_ms) = self.limits.time_ms {
            if self.elapsed_ms() >= time_ms {
                counters.stop = true;
            }
        }
        if counters.stop && !counters.responded_bestmove {
            self.send_uci_info(&mut shared);
            if self.params.verbose_stats {
                self.send_move_stats(&shared);
            }
            let best = self.best_move_internal(&shared, &counters);
            if let Some(best) = best {
                (self.best_move_callback)(best);
            }
            counters.best_move = best;
            counters.responded_bestmove = true;
            shared.best_move_edge = None;

            if counters.found_best_move {
                // We ran out of moves worth searching before running out of
                // time; bank the difference for the next real decision.
                if let Some(time_ms) = self.limits.time_ms {
                    counters.bonus_time_ms = (time_ms - self.elapsed_ms()).max(0);
                }
            }
            self.watchdog_cv.notify_all();
        }
    }

    /// Refresh the smart-pruning playout budget from elapsed time and the
    /// visit/playout limits.
    pub(crate) fn update_remaining_playouts(&self) {
        if self.params.futile_search_aversion <= 0.0 {
            return;
        }
        let mut shared = self.shared.write();
        shared.remaining_playouts = i64::MAX;
        if let Some(time_ms) = self.limits.time_ms {
            let elapsed = self.elapsed_ms();
            if elapsed > SMART_PRUNING_TOLERANCE_MS {
                let nps = (1000 * shared.total_playouts as i64 + SMART_PRUNING_TOLERANCE_NODES)
                    / (elapsed - SMART_PRUNING_TOLERANCE_MS)
                    + 1;
                let remaining_time = time_ms - elapsed;
                let remaining = ((remaining_time * nps) as f64
                    / self.params.futile_search_aversion as f64
                    / 1000.0) as i64;
                shared.remaining_playouts = shared.remaining_playouts.min(remaining);
            }
        }
        if let Some(visits) = self.limits.visits {
            // A batch can overshoot the visits limit, so widen the bound.
            let remaining = visits - shared.total_playouts as i64 - self.initial_visits as i64
                + self.params.minibatch_size as i64
                - 1;
            shared.remaining_playouts = shared.remaining_playouts.min(remaining);
        }
        if let Some(playouts) = self.limits.playouts {
            let remaining =
                playouts - shared.total_playouts as i64 + self.params.minibatch_size as i64 + 1;
            shared.remaining_playouts = shared.remaining_playouts.min(remaining);
        }
        // Even past the limits, allow at least one playout.
        if shared.remaining_playouts <= 1 {
            shared.remaining_playouts = 1;
        }
    }

    /// Emit info if the best edge or depth stats changed, or the emission
    /// interval passed.
    pub(crate) fn maybe_output_info(&self) {
        let mut shared = self.shared.write();
        let counters = self.counters.lock();
        if counters.responded_bestmove || shared.best_move_edge.is_none() {
            return;
        }
        let depth = shared.cum_depth / shared.total_playouts.max(1);
        let changed = match shared.last_info {
            None => true,
            Some(mark) => {
                shared.best_move_edge != shared.last_outputted_best_edge
                    || mark.depth != depth
                    || mark.seldepth != shared.max_depth
                    || mark.time_ms + UCI_INFO_MINIMUM_FREQUENCY_MS < self.elapsed_ms()
            }
        };
        drop(counters);
        if changed {
            self.send_uci_info(&mut shared);
        }
    }

    fn send_uci_info(&self, shared: &mut SharedTree<P::Move>) {
        let Some(best_edge) = shared.best_move_edge else {
            return;
        };
        shared.last_outputted_best_edge = Some(best_edge);
        let depth = shared.cum_depth / shared.total_playouts.max(1);
        let time_ms = self.elapsed_ms();
        let nodes = shared.total_playouts + self.initial_visits as u64;
        let hashfull =
            (self.cache.size() as u64 * 1000 / self.cache.capacity().max(1) as u64) as u32;
        let nps = if time_ms > 0 {
            shared.total_playouts * 1000 / time_ms as u64
        } else {
            0
        };

        let mut pv = Vec::new();
        let mut flip = self.root_position.is_black_to_move();
        let mut edge = best_edge;
        loop {
            pv.push(shared.tree.edge_move(edge).uci(flip));
            flip = !flip;
            let Some(child) = shared.tree.edge_child(edge) else {
                break;
            };
            match self.best_child_no_temperature(shared, child) {
                Some(next) => edge = next,
                None => break,
            }
        }

        let info = ThinkingInfo {
            depth: depth as u32,
            seldepth: shared.max_depth as u32,
            time_ms,
            nodes,
            nps,
            hashfull,
            score_cp: Some(q_to_centipawns(shared.tree.edge_q(best_edge, 0.0))),
            tb_hits: self.tb_hits.load(Ordering::Acquire),
            pv,
            comment: String::new(),
        };
        shared.last_info = Some(InfoMark {
            depth,
            seldepth: shared.max_depth,
            time_ms,
        });
        (self.info_callback)(&info);
    }

    /// Verbose per-root-move statistics, one comment line per edge, sorted
    /// ascending by `(N, Q+U)`.
    fn send_move_stats(&self, shared: &SharedTree<P::Move>) {
        let tree = &shared.tree;
        let root = self.root;
        if !tree.node(root).has_children() {
            return;
        }
        let parent_q = -tree.node(root).q()
            - self.params.fpu_reduction * tree.node(root).visited_policy().sqrt();
        let u_coeff = self.params.cpuct * (tree.node(root).children_visits().max(1) as f32).sqrt();

        let mut edges: Vec<EdgeRef> = (0..tree.num_edges(root))
            .map(|idx| EdgeRef { node: root, idx })
            .collect();
        edges.sort_by(|&a, &b| {
            let ka = (tree.edge_n(a), tree.edge_q(a, parent_q) + tree.edge_u(a, u_coeff));
            let kb = (tree.edge_n(b), tree.edge_q(b, parent_q) + tree.edge_u(b, u_coeff));
            ka.0.cmp(&kb.0).then(ka.1.total_cmp(&kb.1))
        });

        let flip = self.root_position.is_black_to_move();
        for edge in edges {
            let mv = tree.edge_move(edge);
            let q = tree.edge_q(edge, parent_q);
            let u = tree.edge_u(edge, u_coeff);
            let v = if tree.edge_is_terminal(edge) {
                Some(tree.edge_q(edge, 0.0))
            } else {
                self.cached_first_ply_result(mv).map(|q| -q)
            };
            let v_text = match v {
                Some(v) => format!("{:7.4}", v),
                None => " -.----".to_string(),
            };
            let comment = format!(
                "{:<5} ({:4}) N: {:7} (+{:2}) (P: {:5.2}%) (Q: {:8.5}) (U: {:6.5}) (Q+U: {:8.5}) (V: {}) {}",
                mv.uci(flip),
                mv.nn_index(),
                tree.edge_n(edge),
                tree.edge_n_started(edge) - tree.edge_n(edge),
                tree.edge_p(edge) * 100.0,
                q,
                u,
                q + u,
                v_text,
                if tree.edge_is_terminal(edge) { "(T)" } else { "" },
            );
            let info = ThinkingInfo {
                comment,
                ..ThinkingInfo::default()
            };
            (self.info_callback)(&info);
        }
    }

    /// Cached evaluator value for the position one ply after the root.
    fn cached_first_ply_result(&self, mv: P::Move) -> Option<f32> {
        let pos = self.root_position.play(mv);
        let hash = pos.hash_last(self.params.cache_history_length + 1);
        self.cache.lookup(hash).map(|e| e.q)
    }

    fn best_move_internal(
        &self,
        shared: &SharedTree<P::Move>,
        counters: &Counters<P::Move>,
    ) -> Option<BestMoveInfo<P::Move>> {
        if counters.responded_bestmove {
            return counters.best_move;
        }
        if !shared.tree.node(self.root).has_children() {
            return None;
        }

        let mut temperature = self.params.temperature;
        if temperature > 0.0 && self.params.temp_decay_moves > 0 {
            let moves = self.root_position.game_ply() / 2;
            if moves >= self.params.temp_decay_moves {
                temperature = 0.0;
            } else {
                temperature *= (self.params.temp_decay_moves - moves) as f32
                    / self.params.temp_decay_moves as f32;
            }
        }

        let best = if temperature > 0.0 && shared.tree.node(self.root).children_visits() > 0 {
            self.best_child_with_temperature(shared, self.root, temperature)
        } else {
            self.best_child_no_temperature(shared, self.root)
        }?;

        let ponder = shared
            .tree
            .edge_child(best)
            .filter(|&child| shared.tree.node(child).has_children())
            .and_then(|child| self.best_child_no_temperature(shared, child))
            .map(|edge| shared.tree.edge_move(edge));

        Some(BestMoveInfo {
            bestmove: shared.tree.edge_move(best),
            ponder,
        })
    }

    /// The child with the lexicographically largest `(N, Q, P)`. Respects
    /// `searchmoves` at the root.
    pub(crate) fn best_child_no_temperature(
        &self,
        shared: &SharedTree<P::Move>,
        parent: NodeId,
    ) -> Option<EdgeRef> {
        let tree = &shared.tree;
        let mut best: Option<(EdgeRef, (u32, f32, f32))> = None;
        for idx in 0..tree.num_edges(parent) {
            let edge = EdgeRef { node: parent, idx };
            if parent == self.root
                && !self.limits.searchmoves.is_empty()
                && !self.limits.searchmoves.contains(&tree.edge_move(edge))
            {
                continue;
            }
            let key = (tree.edge_n(edge), tree.edge_q(edge, -10.0), tree.edge_p(edge));
            match best {
                Some((_, best_key)) if key <= best_key => {}
                _ => best = Some((edge, key)),
            }
        }
        best.map(|(edge, _)| edge)
    }

    /// A child sampled proportionally to `(N / N_parent)^(1/T)`.
    fn best_child_with_temperature(
        &self,
        shared: &SharedTree<P::Move>,
        parent: NodeId,
        temperature: f32,
    ) -> Option<EdgeRef> {
        let tree = &shared.tree;
        let n_parent = tree.node(parent).n() as f32;
        let mut cumulative = Vec::new();
        let mut eligible = Vec::new();
        let mut sum = 0.0f32;
        for idx in 0..tree.num_edges(parent) {
            let edge = EdgeRef { node: parent, idx };
            if parent == self.root
                && !self.limits.searchmoves.is_empty()
                && !self.limits.searchmoves.contains(&tree.edge_move(edge))
            {
                continue;
            }
            sum += (tree.edge_n(edge) as f32 / n_parent).powf(1.0 / temperature);
            cumulative.push(sum);
            eligible.push(edge);
        }
        if eligible.is_empty() || sum <= 0.0 {
            return None;
        }
        let toss = self.rng.lock().gen_range(0.0..sum);
        let idx = cumulative.partition_point(|&c| c <= toss);
        eligible.get(idx).or_else(|| eligible.last()).copied()
    }
}

impl<P: Position> Drop for Search<P> {
    fn drop(&mut self) {
        self.abort();
        self.wait();
    }
}
