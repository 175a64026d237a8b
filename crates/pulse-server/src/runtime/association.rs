//! Per-context association table.
//!
//! Maps an execution context's identity to the metadata that rides along
//! with it: the request currently bound to it, its checkout count, and its
//! per-medium store bindings. Entries are created lazily on first update and
//! removed only when a context is permanently disposed.

use crate::kv::{KvStore, KvTransaction};
use crate::runtime::request::RequestState;
use crate::runtime::ContextId;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use parking_lot::Mutex;
use pulse_common::error::{PulseError, Result};
use std::sync::Arc;

/// Metadata associated with one live execution context.
///
/// `request` refers to at most one in-flight request at any instant: a
/// context is never shared between two concurrent requests, and rebinding
/// replaces the whole reference.
#[derive(Default)]
pub struct AssociatedState {
    pub request: Option<Arc<RequestState>>,
    pub take_count: u64,
    pub memory: Option<Arc<StoreBinding>>,
    pub disk: Option<Arc<StoreBinding>>,
}

/// Process-wide map from context identity to [`AssociatedState`].
///
/// Concurrent get/update/free from many request paths is safe; contention
/// is naturally partitioned because entries are keyed per context.
#[derive(Default)]
pub struct AssociationTable {
    entries: DashMap<ContextId, AssociatedState>,
}

impl AssociationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ContextId) -> Option<Ref<'_, ContextId, AssociatedState>> {
        self.entries.get(&id)
    }

    /// Apply `f` to the context's state, creating a zero-valued entry first
    /// if none exists.
    pub fn update<F: FnOnce(&mut AssociatedState)>(&self, id: ContextId, f: F) {
        let mut entry = self.entries.entry(id).or_default();
        f(&mut entry);
    }

    /// Remove the entry. Called only when the context is permanently
    /// disposed, never on an ordinary pool return.
    pub fn free(&self, id: ContextId) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A per-context handle on one medium, carrying the transaction that is
/// currently open on behalf of that context's script (if any).
pub struct StoreBinding {
    store: Arc<KvStore>,
    active: Mutex<Option<KvTransaction>>,
}

impl StoreBinding {
    pub fn new(store: Arc<KvStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            active: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Start a transaction on this binding. The previous transaction, if
    /// one was somehow left open, is discarded first.
    pub fn begin(&self, serial: bool) -> Result<()> {
        // A leftover transaction would hold the serial lock we are about
        // to take; drop it before acquiring.
        self.active.lock().take();

        let txn = if serial {
            self.store.begin_serial()?
        } else {
            self.store.begin()?
        };
        *self.active.lock() = Some(txn);
        Ok(())
    }

    /// Commit and clear the active transaction.
    pub fn end(&self) -> Result<()> {
        let txn = self
            .active
            .lock()
            .take()
            .ok_or_else(|| PulseError::Script("no active transaction to commit".into()))?;
        txn.commit()
    }

    /// Drop the active transaction without committing. Pending writes are
    /// abandoned and the serial lock, if held, is released.
    pub fn discard(&self) {
        self.active.lock().take();
    }

    pub fn txn_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.active.lock();
        let txn = guard
            .as_ref()
            .ok_or_else(|| PulseError::Script("store used outside a transaction".into()))?;
        txn.get(key)
    }

    pub fn txn_set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let guard = self.active.lock();
        let txn = guard
            .as_ref()
            .ok_or_else(|| PulseError::Script("store used outside a transaction".into()))?;
        txn.set(key, value)
    }

    pub fn txn_delete(&self, key: &[u8]) -> Result<()> {
        let guard = self.active.lock();
        let txn = guard
            .as_ref()
            .ok_or_else(|| PulseError::Script("store used outside a transaction".into()))?;
        txn.delete(key)
    }
}
