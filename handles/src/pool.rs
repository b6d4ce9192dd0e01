//! Recycling of per-thread handle stores.
//!
//! Execution contexts are short lived compared to their stores: a context
//! hands its store back when it finishes and the next context picks it up,
//! keeping the already grown blocks of the inline chain warm.

use parking_lot::Mutex;

use crate::HandleAccounting;

struct PoolInner<S> {
    idle: Vec<S>,
    created: usize,
    recycled: usize,
}

pub struct ContextPool<S> {
    inner: Mutex<PoolInner<S>>,
    factory: Box<dyn Fn() -> S + Send + Sync>,
    max_idle: usize,
}

impl<S: HandleAccounting> ContextPool<S> {
    pub fn new(max_idle: usize, factory: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: Vec::with_capacity(max_idle),
                created: 0,
                recycled: 0,
            }),
            factory: Box::new(factory),
            max_idle,
        }
    }

    /// Pops an idle store or builds a fresh one.
    pub fn acquire(&self) -> S {
        let mut inner = self.inner.lock();
        if let Some(store) = inner.idle.pop() {
            inner.recycled += 1;
            return store;
        }
        inner.created += 1;
        drop(inner);
        (self.factory)()
    }

    /// Resets `store` and keeps it for the next [`ContextPool::acquire`]
    /// unless the pool already holds `max_idle` stores.
    pub fn release(&self, mut store: S) {
        store.reset();
        assert!(store.is_empty(), "released handle store is not empty after reset");
        debug_assert_eq!(store.count_zone_handles(), 0);
        debug_assert_eq!(store.count_scoped_handles(), 0);

        let mut inner = self.inner.lock();
        if inner.idle.len() < self.max_idle {
            inner.idle.push(store);
        } else {
            drop(inner);
            log::debug!("context pool full ({}), dropping store", self.max_idle);
        }
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// Stores built by the factory so far.
    pub fn created_count(&self) -> usize {
        self.inner.lock().created
    }

    /// Acquisitions served from the idle list.
    pub fn recycled_count(&self) -> usize {
        self.inner.lock().recycled
    }

    /// Bytes held by idle stores across both chains.
    pub fn idle_capacity_in_bytes(&self) -> usize {
        self.inner
            .lock()
            .idle
            .iter()
            .map(|s| s.zone_handles_capacity_in_bytes() + s.scoped_handles_capacity_in_bytes())
            .sum()
    }
}

impl<S> std::fmt::Debug for ContextPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ContextPool")
            .field("idle", &inner.idle.len())
            .field("created", &inner.created)
            .field("recycled", &inner.recycled)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}
