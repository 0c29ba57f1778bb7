//! One search worker: gather a minibatch, prefetch, evaluate, back up.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Gamma};

use crate::batch::CachingComputation;
use crate::node::{EdgeRef, NodeId, Outcome, SharedTree};
use crate::position::{Position, SearchMove};
use crate::search::{Search, SearchError};
use crate::tablebase::{ProbeState, WdlScore};

const DIRICHLET_ALPHA: f64 = 0.3;
const DIRICHLET_EPSILON: f32 = 0.25;
const IDLE_SLEEP: Duration = Duration::from_millis(10);

struct NodeToProcess {
    node: NodeId,
    depth: u16,
    is_collision: bool,
    nn_queried: bool,
    is_cache_hit: bool,
    v: f32,
}

impl NodeToProcess {
    fn collision(node: NodeId, depth: u16) -> Self {
        Self {
            node,
            depth,
            is_collision: true,
            nn_queried: false,
            is_cache_hit: false,
            v: 0.0,
        }
    }

    fn visit(node: NodeId, depth: u16) -> Self {
        Self {
            node,
            depth,
            is_collision: false,
            nn_queried: false,
            is_cache_hit: false,
            v: 0.0,
        }
    }
}

pub(crate) struct SearchWorker<P: Position> {
    search: Arc<Search<P>>,
    minibatch: Vec<NodeToProcess>,
    // Positions along the current descent; index 0 is the root.
    history: Vec<P>,
    rng: ChaCha8Rng,
}

impl<P: Position> SearchWorker<P> {
    pub(crate) fn new(search: Arc<Search<P>>) -> Self {
        let root_position = search.root_position.clone();
        Self {
            search,
            minibatch: Vec::new(),
            history: vec![root_position],
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    pub(crate) fn run_blocking(&mut self) {
        while self.search.is_search_active() {
            if let Err(err) = self.execute_one_iteration() {
                self.search.record_error(err);
                break;
            }
        }
    }

    fn execute_one_iteration(&mut self) -> Result<(), SearchError> {
        // 1. Initialize internal structures.
        let mut computation = CachingComputation::new(
            self.search.network.new_computation(),
            Arc::clone(&self.search.cache),
        );
        self.minibatch.clear();

        // 2. Gather minibatch.
        self.gather_minibatch(&mut computation);

        // 3. Prefetch into cache.
        self.maybe_prefetch_into_cache(&mut computation);

        // 4. Run the evaluator.
        computation.compute_blocking()?;

        // 5. Retrieve results (and terminal values) into nodes.
        self.fetch_minibatch_results(&computation);

        // 6. Propagate the new values to all parents in the tree.
        self.do_backup_update();

        // 7. Update the search's status and progress information.
        self.update_counters();
        Ok(())
    }

    fn gather_minibatch(&mut self, computation: &mut CachingComputation) {
        let params = self.search.params;
        let mut minibatch_size = 0;
        let mut collisions_found = 0;
        // Nodes processed out of order; also bounds the loop so the search
        // can exit.
        let mut number_out_of_order = 0;

        while minibatch_size < params.minibatch_size
            && number_out_of_order < params.minibatch_size
        {
            // If there is something to process without touching the slow
            // evaluator, go do it.
            if minibatch_size > 0 && computation.cache_misses() == 0 {
                return;
            }
            let picked = self.pick_node_to_extend();
            self.minibatch.push(picked);
            let idx = self.minibatch.len() - 1;

            if self.minibatch[idx].is_collision {
                collisions_found += 1;
                if collisions_found > params.allowed_node_collisions {
                    return;
                }
                continue;
            }
            minibatch_size += 1;

            let node = self.minibatch[idx].node;
            // A node already known as terminal was visited before; it only
            // needs its fixed value re-read.
            if !self.node_is_terminal(node) {
                self.extend_node(node);
                if !self.node_is_terminal(node) {
                    let is_cache_hit =
                        self.add_node_to_computation(None, Some(node), true, computation);
                    self.minibatch[idx].nn_queried = true;
                    self.minibatch[idx].is_cache_hit = is_cache_hit;
                }
            }

            if params.out_of_order_eval
                && (self.node_is_terminal(node) || self.minibatch[idx].is_cache_hit)
            {
                // The value is already known; back it up before the batch
                // completes and drop the entry from the minibatch.
                let idx_in_computation = computation.batch_size().saturating_sub(1);
                self.fetch_single_node_result(idx, computation, idx_in_computation);
                self.do_backup_update_single(idx);
                if self.minibatch[idx].nn_queried {
                    computation.pop_cache_hit();
                }
                self.minibatch.pop();
                minibatch_size -= 1;
                number_out_of_order += 1;
            }
        }
    }

    fn node_is_terminal(&self, node: NodeId) -> bool {
        self.search.shared.read().tree.node(node).is_terminal()
    }

    /// Walk from the root by PUCT, reserving each node, until a leaf or a
    /// collision. The whole descent holds the tree lock so the in-flight
    /// claims stay consistent with the best-edge snapshot.
    fn pick_node_to_extend(&mut self) -> NodeToProcess {
        self.history.truncate(1);
        let params = self.search.params;
        let limits = &self.search.limits;
        let mut shared = self.search.shared.write();

        // Best root visits for possible smart pruning.
        let best_node_n = shared
            .best_move_edge
            .map(|e| shared.tree.edge_n(e))
            .unwrap_or(0) as i64;

        let mut node = self.search.root;
        let mut is_root_node = true;
        let mut depth: u16 = 0;
        let mut best_edge: Option<EdgeRef> = None;

        loop {
            if !is_root_node {
                node = shared.tree.get_or_spawn(best_edge.take().unwrap());
            }
            depth += 1;
            if !shared.tree.try_start_score_update(node) {
                return NodeToProcess::collision(node, depth);
            }
            // Terminal or unexamined leaf node: the end of this playout.
            if !shared.tree.node(node).has_children() {
                return NodeToProcess::visit(node, depth);
            }

            let puct_mult = params.cpuct
                * (shared.tree.node(node).children_visits().max(1) as f32).sqrt();
            let node_q = shared.tree.node(node).q();
            let parent_q = if (is_root_node && params.noise) || params.fpu_reduction == 0.0 {
                -node_q
            } else {
                -node_q
                    - params.fpu_reduction * shared.tree.node(node).visited_policy().sqrt()
            };

            let mut best_score = -100.0f32;
            let mut possible_moves = 0;
            let mut chosen: Option<EdgeRef> = None;
            for idx in 0..shared.tree.num_edges(node) {
                let edge = EdgeRef { node, idx };
                if is_root_node {
                    // A child that cannot catch up to the current best
                    // within the remaining playouts is not worth visiting.
                    // The best edge itself always stays eligible.
                    if Some(edge) != shared.best_move_edge
                        && shared.remaining_playouts
                            < best_node_n - shared.tree.edge_n(edge) as i64
                    {
                        continue;
                    }
                    if !limits.searchmoves.is_empty()
                        && !limits.searchmoves.contains(&shared.tree.edge_move(edge))
                    {
                        continue;
                    }
                    possible_moves += 1;
                }
                let q = shared.tree.edge_q(edge, parent_q);
                if params.sticky_checkmate && q == 1.0 && shared.tree.edge_is_terminal(edge) {
                    // A checkmate has infinite confidence; ignore U.
                    chosen = Some(edge);
                    break;
                }
                let score = shared.tree.edge_u(edge, puct_mult) + q;
                if score > best_score {
                    best_score = score;
                    chosen = Some(edge);
                }
            }

            let chosen = match chosen {
                Some(e) => e,
                None => match self.first_eligible_edge(&shared, node, is_root_node) {
                    Some(e) => e,
                    None => {
                        shared.tree.cancel_score_update(node);
                        return NodeToProcess::collision(node, depth);
                    }
                },
            };

            let next = self.history.last().unwrap().play(shared.tree.edge_move(chosen));
            self.history.push(next);
            if is_root_node && possible_moves <= 1 && !limits.infinite {
                // Only one move is theoretically possible within the
                // remaining time; the controller can output it.
                self.search.set_found_best_move();
            }
            best_edge = Some(chosen);
            is_root_node = false;
        }
    }

    /// Fallback when scoring left no candidate (a stale best-edge snapshot
    /// can transiently prune everything): the first searchmoves-eligible
    /// edge, so starvation still produces a move.
    fn first_eligible_edge(
        &self,
        shared: &SharedTree<P::Move>,
        node: NodeId,
        is_root_node: bool,
    ) -> Option<EdgeRef> {
        let limits = &self.search.limits;
        (0..shared.tree.num_edges(node))
            .map(|idx| EdgeRef { node, idx })
            .find(|&edge| {
                !is_root_node
                    || limits.searchmoves.is_empty()
                    || limits.searchmoves.contains(&shared.tree.edge_move(edge))
            })
    }

    /// Classify the freshly reached leaf: terminal by position, terminal by
    /// rule (not at the root), tablebase result, or a new interior node
    /// with one edge per legal move.
    fn extend_node(&mut self, node: NodeId) {
        let pos = self.history.last().unwrap();
        let legal_moves = pos.legal_moves();
        let mut shared = self.search.shared.write();

        if legal_moves.is_empty() {
            // Checkmate or stalemate.
            if pos.is_under_check() {
                shared.tree.make_terminal(node, Outcome::Loss);
            } else {
                shared.tree.make_terminal(node, Outcome::Draw);
            }
            return;
        }

        // Draw-by-rule shortcuts don't fire at the root: producing a move
        // there is the point.
        if node != self.search.root {
            if !pos.has_mating_material() {
                shared.tree.make_terminal(node, Outcome::Draw);
                return;
            }
            if pos.halfmove_clock() >= 100 {
                shared.tree.make_terminal(node, Outcome::Draw);
                return;
            }
            if pos.repetitions() >= 2 {
                shared.tree.make_terminal(node, Outcome::Draw);
                return;
            }

            if let Some(tb) = &self.search.tablebase {
                if !pos.may_castle()
                    && pos.halfmove_clock() == 0
                    && pos.piece_count() <= tb.max_cardinality()
                {
                    let (wdl, state) = tb.probe_wdl(pos);
                    // Only the fail state means the WDL is unusable.
                    if state != ProbeState::Fail {
                        match wdl {
                            WdlScore::Win => shared.tree.make_terminal(node, Outcome::Win),
                            WdlScore::Loss => shared.tree.make_terminal(node, Outcome::Loss),
                            // Cursed wins and blessed losses count as draws.
                            _ => shared.tree.make_terminal(node, Outcome::Draw),
                        }
                        self.search.tb_hits.fetch_add(1, Ordering::AcqRel);
                        return;
                    }
                }
            }
        }

        shared.tree.create_edges(node, legal_moves);
    }

    /// Queue the current history head for evaluation, deduplicating against
    /// the cache. Returns whether the position was already cached.
    fn add_node_to_computation(
        &self,
        shared: Option<&SharedTree<P::Move>>,
        node: Option<NodeId>,
        add_if_cached: bool,
        computation: &mut CachingComputation,
    ) -> bool {
        let pos = self.history.last().unwrap();
        let hash = pos.hash_last(self.search.params.cache_history_length + 1);
        if add_if_cached {
            if computation.add_input_by_hash(hash) {
                return true;
            }
        } else if self.search.cache.contains_key(hash) {
            return true;
        }
        let planes = pos.encode_for_eval();
        let known_moves = match shared {
            Some(shared) => node.and_then(|n| shared.tree.edge_nn_indices(n)),
            None => node.and_then(|n| self.search.shared.read().tree.edge_nn_indices(n)),
        };
        let moves = match known_moves {
            Some(moves) => moves,
            // Caching pseudolegal moves is a bit of a waste, but faster.
            None => pos.pseudolegal_move_indices(),
        };
        computation.add_input(hash, planes, moves);
        false
    }

    /// If the batch has misses but is not full, walk the tree greedily and
    /// warm the cache with positions likely to be wanted soon.
    fn maybe_prefetch_into_cache(&mut self, computation: &mut CachingComputation) {
        let misses = computation.cache_misses();
        if misses == 0 || misses >= self.search.params.max_prefetch_batch {
            return;
        }
        self.history.truncate(1);
        let budget = (self.search.params.max_prefetch_batch - misses) as i32;
        let shared = Arc::clone(&self.search.shared);
        let shared = shared.read();
        self.prefetch_into_cache(&shared, Some(self.search.root), budget, computation);
    }

    /// Prefetch up to `budget` positions under `node` into the cache.
    /// Returns the number of slots consumed. Never mutates visit counts.
    fn prefetch_into_cache(
        &mut self,
        shared: &SharedTree<P::Move>,
        node: Option<NodeId>,
        budget: i32,
        computation: &mut CachingComputation,
    ) -> i32 {
        if budget <= 0 {
            return 0;
        }

        // A leaf not yet being processed: cache it and consume one slot.
        if node.map_or(true, |n| shared.tree.node(n).n_started() == 0) {
            self.add_node_to_computation(Some(shared), node, false, computation);
            return 1;
        }
        let node = node.unwrap();
        // n == 0 with reservations means the node is being extended.
        if shared.tree.node(node).n() == 0 {
            return 0;
        }
        if shared.tree.node(node).is_terminal() {
            return 0;
        }

        let puct_mult = self.search.params.cpuct
            * (shared.tree.node(node).children_visits().max(1) as f32).sqrt();
        // FPU reduction is not taken into account here.
        let parent_q = -shared.tree.node(node).q();

        // Sign-flipped scores so ascending order is best-first.
        let mut scores: Vec<(f32, usize)> = Vec::new();
        for idx in 0..shared.tree.num_edges(node) {
            let edge = EdgeRef { node, idx };
            if shared.tree.edge_p(edge) == 0.0 {
                continue;
            }
            scores.push((
                -shared.tree.edge_u(edge, puct_mult) - shared.tree.edge_q(edge, parent_q),
                idx,
            ));
        }

        let mut first_unsorted = 0usize;
        let mut total_budget_spent = 0;
        let mut budget = budget;
        // Initialized for the single-child case.
        let mut budget_to_spend = budget;
        for i in 0..scores.len() {
            if budget <= 0 {
                break;
            }

            // Sort the next chunk, 3 at a time; that is usually enough.
            if first_unsorted != scores.len() && i + 2 >= first_unsorted {
                let new_unsorted = scores.len().min(if budget < 2 {
                    first_unsorted + 2
                } else {
                    first_unsorted + 3
                });
                let take = new_unsorted - first_unsorted;
                let tail = &mut scores[first_unsorted..];
                if take < tail.len() {
                    tail.select_nth_unstable_by(take - 1, |a, b| a.0.total_cmp(&b.0));
                }
                let sorted_len = take.min(tail.len());
                tail[..sorted_len].sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
                first_unsorted = new_unsorted;
            }

            let edge_idx = scores[i].1;
            let edge = EdgeRef { node, idx: edge_idx };
            // The last child gets the same budget as the previous one.
            if i != scores.len() - 1 {
                // Sign of the score was flipped for sorting; flip it back.
                let next_score = -scores[i + 1].0;
                let q = shared.tree.edge_q(edge, -parent_q);
                budget_to_spend = if next_score > q {
                    budget.min(
                        (shared.tree.edge_p(edge) * puct_mult / (next_score - q)) as i32
                            - shared.tree.edge_n_started(edge) as i32
                            + 1,
                    )
                } else {
                    budget
                };
            }
            let next = self.history.last().unwrap().play(shared.tree.edge_move(edge));
            self.history.push(next);
            let budget_spent = self.prefetch_into_cache(
                shared,
                shared.tree.edge_child(edge),
                budget_to_spend,
                computation,
            );
            self.history.pop();
            budget -= budget_spent;
            total_budget_spent += budget_spent;
        }
        total_budget_spent
    }

    fn fetch_minibatch_results(&mut self, computation: &CachingComputation) {
        let mut idx_in_computation = 0;
        for i in 0..self.minibatch.len() {
            self.fetch_single_node_result(i, computation, idx_in_computation);
            if self.minibatch[i].nn_queried {
                idx_in_computation += 1;
            }
        }
    }

    fn fetch_single_node_result(
        &mut self,
        minibatch_idx: usize,
        computation: &CachingComputation,
        idx_in_computation: usize,
    ) {
        let node = self.minibatch[minibatch_idx].node;
        if !self.minibatch[minibatch_idx].nn_queried {
            // Terminal node: its fixed value needs no further processing.
            self.minibatch[minibatch_idx].v = self.search.shared.read().tree.node(node).q();
            return;
        }

        // The evaluator scores from the side to move; the backup applies
        // values from the in-mover's perspective.
        self.minibatch[minibatch_idx].v = -computation.q(idx_in_computation);

        let mut shared = self.search.shared.write();
        let mut total = 0.0f32;
        for idx in 0..shared.tree.num_edges(node) {
            let edge = EdgeRef { node, idx };
            let mut p = computation.p(idx_in_computation, shared.tree.edge_nn_index(edge));
            if self.search.params.policy_softmax_temp != 1.0 {
                p = p.powf(1.0 / self.search.params.policy_softmax_temp);
            }
            shared.tree.set_edge_p(edge, p);
            // Accumulate only after the store, in case storage rounds.
            total += shared.tree.edge_p(edge);
        }
        if total > 0.0 {
            let scale = 1.0 / total;
            for idx in 0..shared.tree.num_edges(node) {
                let edge = EdgeRef { node, idx };
                let p = shared.tree.edge_p(edge);
                shared.tree.set_edge_p(edge, p * scale);
            }
        }
        if self.search.params.noise && node == self.search.root {
            apply_dirichlet_noise(
                &mut shared,
                node,
                DIRICHLET_EPSILON,
                DIRICHLET_ALPHA,
                &mut self.rng,
            );
        }
    }

    fn do_backup_update(&mut self) {
        let shared = Arc::clone(&self.search.shared);
        let mut shared = shared.write();
        for i in 0..self.minibatch.len() {
            self.backup_single(&mut shared, i);
        }
    }

    fn do_backup_update_single(&mut self, minibatch_idx: usize) {
        let shared = Arc::clone(&self.search.shared);
        let mut shared = shared.write();
        self.backup_single(&mut shared, minibatch_idx);
    }

    fn backup_single(&self, shared: &mut SharedTree<P::Move>, minibatch_idx: usize) {
        let picked = &self.minibatch[minibatch_idx];
        let root = self.search.root;

        if picked.is_collision {
            // Just undo the reservations above the collision point.
            if picked.node != root {
                let mut cur = shared.tree.node(picked.node).parent_id();
                while let Some(id) = cur {
                    shared.tree.cancel_score_update(id);
                    if id == root {
                        break;
                    }
                    cur = shared.tree.node(id).parent_id();
                }
            }
            return;
        }

        // Back the value up to the root, flipping sign each ply. After one
        // visit, V becomes Q.
        let mut v = picked.v;
        let mut cur = Some(picked.node);
        while let Some(id) = cur {
            shared.tree.finalize_score_update(id, v);
            v = -v;

            let parent = shared.tree.node(id).parent_id();
            if parent == Some(root) {
                let n = shared.tree.node(id).n();
                let best_n = shared
                    .best_move_edge
                    .map(|e| shared.tree.edge_n(e))
                    .unwrap_or(0);
                if best_n <= n {
                    shared.best_move_edge =
                        self.search.best_child_no_temperature(shared, root);
                }
            }
            if id == root {
                break;
            }
            cur = parent;
        }
        shared.total_playouts += 1;
        shared.cum_depth += picked.depth as u64;
        shared.max_depth = shared.max_depth.max(picked.depth);
    }

    fn update_counters(&mut self) {
        self.search.update_remaining_playouts();
        self.search.maybe_output_info();
        self.search.maybe_trigger_stop();

        // Collisions don't count as work; if the whole minibatch was
        // collisions, back off for a moment.
        let work_done = self.minibatch.iter().any(|n| !n.is_collision);
        if !work_done {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}

fn apply_dirichlet_noise<M: SearchMove>(
    shared: &mut SharedTree<M>,
    node: NodeId,
    eps: f32,
    alpha: f64,
    rng: &mut impl Rng,
) {
    let num_edges = shared.tree.num_edges(node);
    let gamma = Gamma::new(alpha, 1.0).expect("alpha>0");
    let mut noise = Vec::with_capacity(num_edges);
    let mut total = 0.0f32;
    for _ in 0..num_edges {
        let eta = gamma.sample(rng) as f32;
        noise.push(eta);
        total += eta;
    }
    if total < f32::MIN_POSITIVE {
        return;
    }
    for (idx, eta) in noise.into_iter().enumerate() {
        let edge = EdgeRef { node, idx };
        let p = shared.tree.edge_p(edge);
        shared.tree.set_edge_p(edge, p * (1.0 - eps) + eps * eta / total);
    }
}
