pub mod association;
pub mod bindings;
pub mod context;
pub mod pool;
pub mod request;

#[cfg(test)]
mod tests;

pub use association::{AssociatedState, AssociationTable, StoreBinding};
pub use context::ScriptContext;
pub use pool::{ContextPool, ExecutionContext, PoolConfig};
pub use request::{RequestState, ResponseState};

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of one execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}
