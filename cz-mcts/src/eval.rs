//! Evaluator and evaluation-cache capability traits, with baseline
//! implementations.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("network evaluation failed: {0}")]
    Backend(String),
}

/// One in-flight batch of network evaluations.
///
/// `q(i)` is the value head output in `[-1, 1]` from the perspective of the
/// side to move in input `i`; `p(i, move_index)` is the raw policy-head
/// weight for one move.
pub trait NetworkComputation: Send {
    fn add_input(&mut self, planes: Vec<f32>);
    fn compute_blocking(&mut self) -> Result<(), EvalError>;
    fn batch_size(&self) -> usize;
    fn q(&self, idx: usize) -> f32;
    fn p(&self, idx: usize, move_index: u16) -> f32;
}

pub trait Network: Send + Sync {
    fn new_computation(&self) -> Box<dyn NetworkComputation>;
}

/// Uniform policy + zero value (baseline stub).
pub struct UniformNetwork;

struct UniformComputation {
    inputs: usize,
}

impl NetworkComputation for UniformComputation {
    fn add_input(&mut self, _planes: Vec<f32>) {
        self.inputs += 1;
    }

    fn compute_blocking(&mut self) -> Result<(), EvalError> {
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.inputs
    }

    fn q(&self, _idx: usize) -> f32 {
        0.0
    }

    fn p(&self, _idx: usize, _move_index: u16) -> f32 {
        // Equal weight per move; normalization happens during policy
        // post-processing.
        1.0
    }
}

impl Network for UniformNetwork {
    fn new_computation(&self) -> Box<dyn NetworkComputation> {
        Box::new(UniformComputation { inputs: 0 })
    }
}

/// One cached evaluator output: value plus per-move priors keyed by
/// policy-head index.
#[derive(Debug, Clone)]
pub struct CachedEval {
    pub q: f32,
    pub p: Vec<(u16, f32)>,
}

impl CachedEval {
    pub fn p_for(&self, move_index: u16) -> f32 {
        self.p
            .iter()
            .find(|(mi, _)| *mi == move_index)
            .map_or(0.0, |(_, p)| *p)
    }
}

/// The shared evaluation cache. Implementations must be thread-safe; all
/// workers funnel through one instance.
pub trait EvalCache: Send + Sync {
    fn lookup(&self, hash: u64) -> Option<Arc<CachedEval>>;
    fn insert(&self, hash: u64, eval: CachedEval);
    fn contains_key(&self, hash: u64) -> bool;
    fn size(&self) -> usize;
    fn capacity(&self) -> usize;
    fn clear(&self);
    fn set_capacity(&self, capacity: usize);
}

struct CacheInner {
    entries: FxHashMap<u64, Arc<CachedEval>>,
    // Insertion order, for eviction. Keys are unique here because only
    // fresh inserts are pushed.
    order: VecDeque<u64>,
    capacity: usize,
}

impl CacheInner {
    fn evict_to_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.entries.remove(&old);
                }
                None => break,
            }
        }
    }
}

/// In-memory evaluation cache with insertion-order eviction.
pub struct TranspositionCache {
    inner: Mutex<CacheInner>,
}

impl TranspositionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: FxHashMap::default(),
                order: VecDeque::new(),
                capacity,
            }),
        }
    }
}

impl Default for TranspositionCache {
    fn default() -> Self {
        Self::new(200_000)
    }
}

impl EvalCache for TranspositionCache {
    fn lookup(&self, hash: u64) -> Option<Arc<CachedEval>> {
        self.inner.lock().entries.get(&hash).cloned()
    }

    fn insert(&self, hash: u64, eval: CachedEval) {
        let mut inner = self.inner.lock();
        if inner.entries.insert(hash, Arc::new(eval)).is_none() {
            inner.order.push_back(hash);
        }
        inner.evict_to_capacity();
    }

    fn contains_key(&self, hash: u64) -> bool {
        self.inner.lock().entries.contains_key(&hash)
    }

    fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity;
        inner.evict_to_capacity();
    }
}
