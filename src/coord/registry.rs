//! Registry of live workers
//!
//! Workers are kept in join order. Selection is round-robin with a cursor
//! that is clamped whenever the set shrinks, so it always points at a live
//! entry (or at zero when the set is empty).

use tracing::debug;

use crate::coord::types::{WorkerHandle, WorkerId};

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerHandle>,
    cursor: usize,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Returns `false` if it was already registered.
    pub fn register(&mut self, worker: WorkerHandle) -> bool {
        if self.contains(worker.id) {
            debug!("{} registered again, ignoring", worker.id);
            return false;
        }
        self.workers.push(worker);
        true
    }

    /// Remove a worker, returning its handle if it was live
    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        let index = self.workers.iter().position(|w| w.id == id)?;
        let removed = self.workers.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.workers.len() {
            self.cursor = 0;
        }
        Some(removed)
    }

    /// Next worker in round-robin order that `has_capacity` accepts.
    ///
    /// Skips `avoid` when another accepted worker exists. Returns `None` when
    /// the registry is empty or every live worker is refused.
    pub fn next_available<F>(&mut self, avoid: Option<WorkerId>, has_capacity: F) -> Option<WorkerHandle>
    where
        F: Fn(WorkerId) -> bool,
    {
        let len = self.workers.len();
        let start = self.cursor;
        let mut fallback = None;
        for step in 0..len {
            let index = (start + step) % len;
            let id = self.workers[index].id;
            if !has_capacity(id) {
                continue;
            }
            if Some(id) != avoid {
                return Some(self.pick(index));
            }
            fallback.get_or_insert(index);
        }
        fallback.map(|index| self.pick(index))
    }

    fn pick(&mut self, index: usize) -> WorkerHandle {
        self.cursor = (index + 1) % self.workers.len();
        self.workers[index].clone()
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.iter().any(|w| w.id == id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Drop every handle, closing the registry's side of all mailboxes
    pub fn clear(&mut self) {
        self.workers.clear();
        self.cursor = 0;
    }
}
