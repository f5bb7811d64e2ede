use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// WorkerCounter tracks the number of active tunnels. Clones share the
/// same count.
#[derive(Debug, Clone, Default)]
pub struct WorkerCounter {
    count: Arc<AtomicUsize>,
}

impl WorkerCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// decrement lowers the count, saturating at zero
    pub fn decrement(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn value(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// enter increments the count and returns a guard that decrements it
    /// when dropped
    pub fn enter(&self) -> WorkerGuard {
        self.increment();
        WorkerGuard {
            counter: self.clone(),
        }
    }
}

/// WorkerGuard accounts for one tunnel for as long as it lives
#[derive(Debug)]
pub struct WorkerGuard {
    counter: WorkerCounter,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}
