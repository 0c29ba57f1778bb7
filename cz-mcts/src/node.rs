//! Arena-backed game tree with per-node visit statistics.
//!
//! Nodes live in a flat `Vec` and are addressed by `NodeId`; children are
//! spawned lazily through their parent edge. `q` is stored from the
//! perspective of the player who moved into the node, so edge values read at
//! a parent are already in that parent's side-to-move perspective.

use crate::position::SearchMove;

pub type NodeId = u32;

/// Game-theoretic result of a terminal node, from the perspective of the
/// side to move at that node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    /// The side to move wins (e.g. a winning tablebase probe).
    Win,
    /// The side to move loses (e.g. it is checkmated).
    Loss,
    Draw,
}

#[derive(Clone, Debug)]
pub struct Edge<M> {
    mv: M,
    nn_index: u16,
    p: f32,
    child: Option<NodeId>,
}

impl<M: SearchMove> Edge<M> {
    fn new(mv: M) -> Self {
        Self {
            mv,
            nn_index: mv.nn_index(),
            p: 0.0,
            child: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Node<M> {
    n: u32,
    in_flight: u32,
    q: f32,
    terminal: Option<Outcome>,
    visited_policy: f32,
    edges: Option<Box<[Edge<M>]>>,
    // Parent id plus this node's edge index within the parent.
    parent: Option<(NodeId, u16)>,
}

impl<M> Node<M> {
    fn new(parent: Option<(NodeId, u16)>) -> Self {
        Self {
            n: 0,
            in_flight: 0,
            q: 0.0,
            terminal: None,
            visited_policy: 0.0,
            edges: None,
            parent,
        }
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn n_in_flight(&self) -> u32 {
        self.in_flight
    }

    pub fn n_started(&self) -> u32 {
        self.n + self.in_flight
    }

    pub fn q(&self) -> f32 {
        self.q
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn has_children(&self) -> bool {
        self.edges.is_some()
    }

    pub fn visited_policy(&self) -> f32 {
        self.visited_policy
    }

    /// Completed visits that went through a child. The first visit
    /// terminated at this node itself.
    pub fn children_visits(&self) -> u32 {
        self.n.saturating_sub(1)
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent.map(|(id, _)| id)
    }
}

/// A half-edge address: parent node plus edge index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EdgeRef {
    pub node: NodeId,
    pub idx: usize,
}

/// The tree arena itself.
pub struct Tree<M> {
    nodes: Vec<Node<M>>,
    root: NodeId,
}

impl<M: SearchMove> Tree<M> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(None)],
            root: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node<M> {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node<M> {
        &mut self.nodes[id as usize]
    }

    /// Reservation primitive. Fails exactly when the node is unvisited and
    /// another worker already holds an in-flight claim on it; that is the
    /// collision signal for the selection loop.
    pub fn try_start_score_update(&mut self, id: NodeId) -> bool {
        let node = self.node_mut(id);
        if node.n == 0 && node.in_flight > 0 {
            return false;
        }
        node.in_flight += 1;
        true
    }

    /// Undo a reservation without contributing a visit.
    pub fn cancel_score_update(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        debug_assert!(node.in_flight > 0);
        node.in_flight -= 1;
    }

    /// Convert a reservation into a completed visit, folding `v` into the
    /// running mean. On a node's first visit its prior is added to the
    /// parent's visited-policy sum.
    pub fn finalize_score_update(&mut self, id: NodeId, v: f32) {
        let node = self.node_mut(id);
        debug_assert!(node.in_flight > 0);
        let first_visit = node.n == 0;
        node.q += (v - node.q) / (node.n + 1) as f32;
        node.n += 1;
        node.in_flight -= 1;
        if first_visit {
            if let Some((pid, eidx)) = self.nodes[id as usize].parent {
                let p = self.nodes[pid as usize].edges.as_ref().unwrap()[eidx as usize].p;
                self.nodes[pid as usize].visited_policy += p;
            }
        }
    }

    /// Tag the node with a fixed game-theoretic value. Terminal nodes never
    /// get edges.
    pub fn make_terminal(&mut self, id: NodeId, outcome: Outcome) {
        let node = self.node_mut(id);
        debug_assert!(node.edges.is_none());
        node.terminal = Some(outcome);
        node.q = match outcome {
            Outcome::Win => -1.0,
            Outcome::Loss => 1.0,
            Outcome::Draw => 0.0,
        };
    }

    /// Attach one edge per legal move. Priors start at zero and are filled
    /// in when the evaluation arrives.
    pub fn create_edges(&mut self, id: NodeId, moves: Vec<M>) {
        let node = self.node_mut(id);
        debug_assert!(node.edges.is_none() && node.terminal.is_none());
        node.edges = Some(moves.into_iter().map(Edge::new).collect());
    }

    pub fn num_edges(&self, id: NodeId) -> usize {
        self.node(id).edges.as_ref().map_or(0, |e| e.len())
    }

    pub fn find_edge(&self, id: NodeId, mv: M) -> Option<usize> {
        self.node(id)
            .edges
            .as_ref()
            .and_then(|edges| edges.iter().position(|e| e.mv == mv))
    }

    /// Policy-head indices of all edges, or `None` if the node has no edges.
    pub fn edge_nn_indices(&self, id: NodeId) -> Option<Vec<u16>> {
        self.node(id)
            .edges
            .as_ref()
            .map(|edges| edges.iter().map(|e| e.nn_index).collect())
    }

    fn edge(&self, e: EdgeRef) -> &Edge<M> {
        &self.node(e.node).edges.as_ref().unwrap()[e.idx]
    }

    pub fn edge_move(&self, e: EdgeRef) -> M {
        self.edge(e).mv
    }

    pub fn edge_nn_index(&self, e: EdgeRef) -> u16 {
        self.edge(e).nn_index
    }

    pub fn edge_p(&self, e: EdgeRef) -> f32 {
        self.edge(e).p
    }

    pub fn set_edge_p(&mut self, e: EdgeRef, p: f32) {
        self.nodes[e.node as usize].edges.as_mut().unwrap()[e.idx].p = p;
    }

    pub fn edge_child(&self, e: EdgeRef) -> Option<NodeId> {
        self.edge(e).child
    }

    pub fn edge_n(&self, e: EdgeRef) -> u32 {
        self.edge(e).child.map_or(0, |c| self.node(c).n)
    }

    pub fn edge_n_started(&self, e: EdgeRef) -> u32 {
        self.edge(e).child.map_or(0, |c| self.node(c).n_started())
    }

    pub fn edge_is_terminal(&self, e: EdgeRef) -> bool {
        self.edge(e).child.map_or(false, |c| self.node(c).is_terminal())
    }

    /// Mean value of the child, or `default_q` while it has no visits.
    pub fn edge_q(&self, e: EdgeRef, default_q: f32) -> f32 {
        match self.edge(e).child {
            Some(c) if self.node(c).n > 0 => self.node(c).q,
            _ => default_q,
        }
    }

    /// Exploration term: `puct_mult * P / (1 + N + n_in_flight)`.
    pub fn edge_u(&self, e: EdgeRef, puct_mult: f32) -> f32 {
        self.edge(e).p * puct_mult / (1.0 + self.edge_n_started(e) as f32)
    }

    /// The child behind the edge, spawned on first descent.
    pub fn get_or_spawn(&mut self, e: EdgeRef) -> NodeId {
        if let Some(c) = self.edge(e).child {
            return c;
        }
        let id = self.nodes.len() as NodeId;
        self.nodes.push(Node::new(Some((e.node, e.idx as u16))));
        self.nodes[e.node as usize].edges.as_mut().unwrap()[e.idx].child = Some(id);
        id
    }

    /// Discard everything and start from a fresh root.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.nodes.push(Node::new(None));
        self.root = 0;
    }

    /// Re-root at `new_root`, dropping every node outside its subtree. The
    /// arena is compacted, so all previously held ids become invalid.
    pub fn promote_to_root(&mut self, new_root: NodeId) {
        let mut remap = vec![u32::MAX; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack = vec![new_root];
        while let Some(id) = stack.pop() {
            remap[id as usize] = order.len() as u32;
            order.push(id);
            if let Some(edges) = self.nodes[id as usize].edges.as_ref() {
                for e in edges.iter() {
                    if let Some(c) = e.child {
                        stack.push(c);
                    }
                }
            }
        }
        let mut new_nodes = Vec::with_capacity(order.len());
        for &old_id in &order {
            let mut node = self.nodes[old_id as usize].clone();
            node.parent = if old_id == new_root {
                None
            } else {
                node.parent.map(|(pid, eidx)| (remap[pid as usize], eidx))
            };
            if let Some(edges) = node.edges.as_mut() {
                for e in edges.iter_mut() {
                    e.child = e.child.map(|c| remap[c as usize]);
                }
            }
            new_nodes.push(node);
        }
        self.nodes = new_nodes;
        self.root = 0;
    }
}

impl<M: SearchMove> Default for Tree<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// The tree plus the search-progress fields that must be read consistently
/// with it (smart pruning reads the best-edge snapshot and the remaining
/// playout budget during descent, under the same lock).
pub struct SharedTree<M> {
    pub(crate) tree: Tree<M>,
    pub(crate) best_move_edge: Option<EdgeRef>,
    pub(crate) last_outputted_best_edge: Option<EdgeRef>,
    pub(crate) total_playouts: u64,
    pub(crate) cum_depth: u64,
    pub(crate) max_depth: u16,
    pub(crate) remaining_playouts: i64,
    pub(crate) last_info: Option<InfoMark>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct InfoMark {
    pub depth: u64,
    pub seldepth: u16,
    pub time_ms: i64,
}

impl<M: SearchMove> SharedTree<M> {
    pub fn new() -> Self {
        Self {
            tree: Tree::new(),
            best_move_edge: None,
            last_outputted_best_edge: None,
            total_playouts: 0,
            cum_depth: 0,
            max_depth: 0,
            remaining_playouts: i64::MAX,
            last_info: None,
        }
    }

    /// Clear per-search progress before a new search starts on this tree.
    pub(crate) fn reset_search_progress(&mut self) {
        self.best_move_edge = None;
        self.last_outputted_best_edge = None;
        self.total_playouts = 0;
        self.cum_depth = 0;
        self.max_depth = 0;
        self.remaining_playouts = i64::MAX;
        self.last_info = None;
    }

    pub fn tree(&self) -> &Tree<M> {
        &self.tree
    }
}

impl<M: SearchMove> Default for SharedTree<M> {
    fn default() -> Self {
        Self::new()
    }
}
