//! Game-lifecycle ownership of the search tree: reset for a new game,
//! re-root when moves are played, reuse the searched subtree.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::node::SharedTree;
use crate::position::Position;

/// Owns the tree across moves of one game. A `Search` borrows the tree for
/// the duration of one `go`; between searches the tree may be re-rooted.
pub struct NodeTree<P: Position> {
    shared: Arc<RwLock<SharedTree<P::Move>>>,
    base: P,
    played: Vec<P::Move>,
    head_position: P,
}

impl<P: Position> NodeTree<P> {
    pub fn new(base: P) -> Self {
        Self {
            shared: Arc::new(RwLock::new(SharedTree::new())),
            head_position: base.clone(),
            base,
            played: Vec::new(),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<RwLock<SharedTree<P::Move>>> {
        &self.shared
    }

    pub fn head_position(&self) -> &P {
        &self.head_position
    }

    pub fn node_count(&self) -> usize {
        self.shared.read().tree.len()
    }

    /// Advance the head by one played move. The searched subtree under that
    /// move survives; siblings are discarded in bulk by arena compaction.
    pub fn make_move(&mut self, mv: P::Move) {
        let mut shared = self.shared.write();
        let root = shared.tree.root();
        let child = shared
            .tree
            .find_edge(root, mv)
            .and_then(|idx| shared.tree.edge_child(crate::node::EdgeRef { node: root, idx }));
        match child {
            Some(child) => shared.tree.promote_to_root(child),
            None => shared.tree.reset(),
        }
        shared.reset_search_progress();
        drop(shared);
        self.head_position = self.head_position.play(mv);
        self.played.push(mv);
    }

    /// Point the tree at `base` with `moves` applied. When the new line
    /// extends the current one from the same base, the tree is re-rooted
    /// move by move and the searched subtree survives; otherwise everything
    /// is rebuilt from scratch.
    pub fn reset_to(&mut self, base: P, moves: &[P::Move]) {
        let extends = base == self.base
            && moves.len() >= self.played.len()
            && moves[..self.played.len()] == self.played[..];
        if extends {
            let suffix: Vec<P::Move> = moves[self.played.len()..].to_vec();
            for mv in suffix {
                self.make_move(mv);
            }
            return;
        }
        let mut shared = self.shared.write();
        shared.tree.reset();
        shared.reset_search_progress();
        drop(shared);
        self.base = base.clone();
        self.played = moves.to_vec();
        let mut head = base;
        for &mv in moves {
            head = head.play(mv);
        }
        self.head_position = head;
    }
}
