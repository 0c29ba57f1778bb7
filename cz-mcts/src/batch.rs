//! Batched evaluation with cache de-duplication.
//!
//! `CachingComputation` fronts one network batch: inputs already present in
//! the shared cache are served from it, everything else is queued for the
//! evaluator, and fresh results are written back to the cache after the
//! blocking compute.

use std::sync::Arc;

use crate::eval::{CachedEval, EvalCache, EvalError, NetworkComputation};

enum Entry {
    Hit(Arc<CachedEval>),
    Miss {
        nn_idx: usize,
        hash: u64,
        move_indices: Vec<u16>,
    },
}

pub struct CachingComputation {
    inner: Box<dyn NetworkComputation>,
    cache: Arc<dyn EvalCache>,
    entries: Vec<Entry>,
    misses: usize,
}

impl CachingComputation {
    pub fn new(inner: Box<dyn NetworkComputation>, cache: Arc<dyn EvalCache>) -> Self {
        Self {
            inner,
            cache,
            entries: Vec::new(),
            misses: 0,
        }
    }

    /// Serve the input from the cache if present. Returns true on a hit.
    pub fn add_input_by_hash(&mut self, hash: u64) -> bool {
        match self.cache.lookup(hash) {
            Some(e) => {
                self.entries.push(Entry::Hit(e));
                true
            }
            None => false,
        }
    }

    /// Queue an input for the evaluator. `move_indices` are the policy-head
    /// indices whose priors will be retained in the cache entry.
    pub fn add_input(&mut self, hash: u64, planes: Vec<f32>, move_indices: Vec<u16>) {
        let nn_idx = self.inner.batch_size();
        self.inner.add_input(planes);
        self.entries.push(Entry::Miss {
            nn_idx,
            hash,
            move_indices,
        });
        self.misses += 1;
    }

    pub fn cache_misses(&self) -> usize {
        self.misses
    }

    /// Queued entries, hits and misses alike, in submission order.
    pub fn batch_size(&self) -> usize {
        self.entries.len()
    }

    /// Drop the most recently added entry if it was served from the cache.
    /// Used by out-of-order eval after the entry has been backed up.
    pub fn pop_cache_hit(&mut self) {
        debug_assert!(matches!(self.entries.last(), Some(Entry::Hit(_))));
        self.entries.pop();
    }

    /// Run the evaluator on the queued misses and publish the results to
    /// the cache. A batch without misses never touches the evaluator.
    pub fn compute_blocking(&mut self) -> Result<(), EvalError> {
        if self.misses == 0 {
            return Ok(());
        }
        self.inner.compute_blocking()?;
        for entry in &self.entries {
            if let Entry::Miss {
                nn_idx,
                hash,
                move_indices,
            } = entry
            {
                let eval = CachedEval {
                    q: self.inner.q(*nn_idx),
                    p: move_indices
                        .iter()
                        .map(|&mi| (mi, self.inner.p(*nn_idx, mi)))
                        .collect(),
                };
                self.cache.insert(*hash, eval);
            }
        }
        Ok(())
    }

    pub fn q(&self, idx: usize) -> f32 {
        match &self.entries[idx] {
            Entry::Hit(e) => e.q,
            Entry::Miss { nn_idx, .. } => self.inner.q(*nn_idx),
        }
    }

    pub fn p(&self, idx: usize, move_index: u16) -> f32 {
        match &self.entries[idx] {
            Entry::Hit(e) => e.p_for(move_index),
            Entry::Miss { nn_idx, .. } => self.inner.p(*nn_idx, move_index),
        }
    }
}
