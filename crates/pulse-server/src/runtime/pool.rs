//! Concurrent pool of execution contexts.
//!
//! Contexts are expensive to create, so the pool hands each in-flight
//! request an exclusive, already-initialized context and takes it back
//! afterwards. Selection is uniformly random rather than FIFO/LIFO, which
//! spreads checkout counts evenly across the pool and keeps take O(1) via
//! swap-remove.
//!
//! The pool never shrinks on its own and grows without an upper bound: an
//! empty available set means the caller pays for a fresh context inline.
//! A context that crosses the retirement threshold is torn down and
//! replaced on a detached background task, never on the caller's path.

use crate::runtime::{AssociationTable, ContextId};
use pulse_common::error::{PulseError, Result};
use rand::Rng;
use std::sync::{Arc, Mutex};

/// Capability interface the pool is written against.
///
/// The pool and association table never touch a concrete scripting engine
/// type; anything that can be initialized, invoked by handler name, and
/// explicitly closed can be pooled.
pub trait ExecutionContext: Send + Sync + 'static {
    fn id(&self) -> ContextId;

    /// Run the named handler to completion and return its string result.
    fn invoke(&self, handler: &str) -> Result<String>;

    /// Dispose the context. Contexts are never garbage-collected
    /// implicitly; this is called exactly once, on recycling or shutdown.
    fn close(&self);
}

/// Configuration for the context pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Number of contexts built eagerly at startup.
    pub initial_size: usize,
    /// Checkout count after which a context is retired instead of reused.
    pub retire_after: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 32,
            retire_after: 10_000,
        }
    }
}

type ContextFactory<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

/// Pool of execution contexts with randomized eviction, on-demand growth,
/// and usage-based recycling.
pub struct ContextPool<C: ExecutionContext> {
    inner: Arc<PoolInner<C>>,
}

impl<C: ExecutionContext> Clone for ContextPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<C: ExecutionContext> {
    available: Mutex<Vec<Arc<C>>>,
    factory: ContextFactory<C>,
    associations: Arc<AssociationTable>,
    config: PoolConfig,
}

impl<C: ExecutionContext> ContextPool<C> {
    /// Build a pool of `config.initial_size` fully initialized contexts.
    /// The factory is kept and reused whenever the pool grows or recycles.
    pub fn new(
        config: PoolConfig,
        associations: Arc<AssociationTable>,
        factory: impl Fn() -> Result<C> + Send + Sync + 'static,
    ) -> Result<Self> {
        let mut contexts = Vec::with_capacity(config.initial_size);
        for _ in 0..config.initial_size {
            contexts.push(Arc::new(factory()?));
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                available: Mutex::new(contexts),
                factory: Box::new(factory),
                associations,
                config,
            }),
        })
    }

    /// Take an exclusive context out of the pool.
    ///
    /// Picks a uniformly random member of the available set, or builds a
    /// fresh one inline when the set is empty. The pool lock covers only
    /// the membership mutation; context construction runs outside it.
    /// Every successful take increments the context's checkout count.
    pub fn take(&self) -> Result<Arc<C>> {
        let ctx = {
            let mut available = self.inner.available.lock().unwrap();
            match available.len() {
                0 => None,
                1 => available.pop(),
                len => {
                    let index = rand::thread_rng().gen_range(0..len);
                    Some(available.swap_remove(index))
                }
            }
        };

        let ctx = match ctx {
            Some(ctx) => ctx,
            None => Arc::new(
                (self.inner.factory)()
                    .map_err(|e| PulseError::Allocation(e.to_string()))?,
            ),
        };

        self.inner
            .associations
            .update(ctx.id(), |state| state.take_count += 1);

        Ok(ctx)
    }

    /// Return a context to the pool.
    ///
    /// A context past the retirement threshold is not re-pooled: teardown
    /// and replacement happen on a detached blocking task so the caller is
    /// never held up by reinitialization cost. Everything else goes
    /// straight back into the available set.
    pub fn return_context(&self, ctx: Arc<C>) {
        let take_count = self
            .inner
            .associations
            .get(ctx.id())
            .map(|state| state.take_count)
            .unwrap_or(0);

        if take_count > self.inner.config.retire_after {
            tracing::debug!(context = %ctx.id(), take_count, "retiring context");
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.recycle(ctx));
            return;
        }

        self.inner.available.lock().unwrap().push(ctx);
    }

    /// Dispose a context without returning it, leaving the pool one short.
    /// Used when a handler failed and the context's internal state can no
    /// longer be trusted.
    pub fn discard(&self, ctx: Arc<C>) {
        tracing::debug!(context = %ctx.id(), "discarding context");
        ctx.close();
        self.inner.associations.free(ctx.id());
    }

    /// Synchronously close every context currently in the available set and
    /// clear their association entries. Checked-out contexts are the
    /// holder's responsibility.
    pub fn cleanup(&self) {
        let drained: Vec<_> = {
            let mut available = self.inner.available.lock().unwrap();
            available.drain(..).collect()
        };
        for ctx in drained {
            ctx.close();
            self.inner.associations.free(ctx.id());
        }
    }

    /// Number of contexts currently available for checkout.
    pub fn available(&self) -> usize {
        self.inner.available.lock().unwrap().len()
    }
}

impl<C: ExecutionContext> PoolInner<C> {
    /// Close a retired context and push a freshly initialized replacement.
    /// Runs off the Return path; a replacement failure is logged and the
    /// pool temporarily runs one context short.
    fn recycle(&self, old: Arc<C>) {
        old.close();
        self.associations.free(old.id());

        match (self.factory)() {
            Ok(fresh) => {
                self.available.lock().unwrap().push(Arc::new(fresh));
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to allocate replacement context");
            }
        }
    }
}
