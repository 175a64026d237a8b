//! Transactional key-value layer over redb.
//!
//! Two mediums exist: a volatile in-memory store and a durable file-backed
//! store. Keys and values are opaque byte sequences; keys are unique and
//! lexicographically ordered within a medium. No encoding is imposed here;
//! JSON or other structuring is the caller's concern.
//!
//! Transactions come in two modes. A plain transaction relies on the
//! engine's own concurrency control (redb serializes writers, so two
//! concurrent transactions queue rather than conflict at commit). A serial
//! transaction additionally holds a medium-wide lock for its whole lifetime,
//! for script logic that needs strict read-modify-write correctness across
//! several host calls.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use pulse_common::error::{PulseError, Result};
use redb::{backends::InMemoryBackend, Builder, Database, Durability, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("pulse");

/// A named storage backend for the key-value layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Medium {
    Memory,
    Disk,
}

impl Medium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Medium::Memory => "memory",
            Medium::Disk => "disk",
        }
    }
}

/// A key-value pair returned by [`KvStore::list_pairs`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// One medium of the key-value store.
///
/// The underlying database handle is a shared singleton per medium; the
/// engine handles concurrent-transaction correctness except where the
/// serial variant imposes external mutual exclusion.
pub struct KvStore {
    medium: Medium,
    db: Database,
    serial_lock: Arc<Mutex<()>>,
    sync_writes: bool,
}

impl KvStore {
    /// Open the volatile medium. Nothing survives a process restart.
    pub fn memory() -> Result<Self> {
        let db = Builder::new().create_with_backend(InMemoryBackend::new())?;
        Self::open(Medium::Memory, db, false)
    }

    /// Open the durable medium under `dir`. When `sync_writes` is set,
    /// commits do not return until the data has reached stable storage.
    pub fn disk(dir: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let db = Database::create(dir.as_ref().join("pulse.redb"))?;
        Self::open(Medium::Disk, db, sync_writes)
    }

    fn open(medium: Medium, db: Database, sync_writes: bool) -> Result<Self> {
        // Create the table up front so snapshot reads never observe a
        // missing table.
        let txn = db.begin_write()?;
        txn.open_table(TABLE)?;
        txn.commit()?;

        Ok(Self {
            medium,
            db,
            serial_lock: Arc::new(Mutex::new(())),
            sync_writes,
        })
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    /// Snapshot point read outside any transaction. An absent key is
    /// `Ok(None)`, never an error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(TABLE)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// List up to `limit` keys that start with `prefix`, in lexicographic
    /// order, over a single consistent snapshot.
    pub fn list_keys(&self, prefix: &[u8], limit: usize) -> Result<Vec<Vec<u8>>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(TABLE)?;

        let mut results = Vec::new();
        for entry in table.range::<&[u8]>(prefix..)? {
            if results.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(key.value().to_vec());
        }

        Ok(results)
    }

    /// List up to `limit` pairs whose keys start with `prefix`, in key
    /// order, over a single consistent snapshot.
    pub fn list_pairs(&self, prefix: &[u8], limit: usize) -> Result<Vec<Pair>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(TABLE)?;

        let mut results = Vec::new();
        for entry in table.range::<&[u8]>(prefix..)? {
            if results.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(Pair {
                key: key.value().to_vec(),
                value: value.value().to_vec(),
            });
        }

        Ok(results)
    }

    /// Start a transaction. Isolation against other concurrent transactions
    /// is the engine's; with redb a second writer queues until this one
    /// commits or is dropped.
    pub fn begin(&self) -> Result<KvTransaction> {
        self.transaction(None)
    }

    /// Start a serial transaction: identical semantics to [`Self::begin`]
    /// plus a medium-wide exclusive lock held until the transaction ends,
    /// so no other serial transaction on this medium overlaps with it.
    pub fn begin_serial(&self) -> Result<KvTransaction> {
        let guard = self.serial_lock.lock_arc();
        self.transaction(Some(guard))
    }

    fn transaction(&self, serial: Option<ArcMutexGuard<RawMutex, ()>>) -> Result<KvTransaction> {
        let mut txn = self
            .db
            .begin_write()
            .map_err(|e| PulseError::Allocation(format!("failed to start transaction: {}", e)))?;
        txn.set_durability(if self.sync_writes {
            Durability::Immediate
        } else {
            Durability::Eventual
        });

        Ok(KvTransaction {
            txn,
            _serial: serial,
        })
    }
}

/// An active transaction bound to one medium.
///
/// Writes stay in the pending view until [`KvTransaction::commit`]; dropping
/// an uncommitted transaction discards them. There is no explicit abort.
pub struct KvTransaction {
    txn: redb::WriteTransaction,
    // Held for the whole transaction lifetime; released on commit or drop.
    _serial: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KvTransaction {
    /// Read from the pending view. Absent keys are `Ok(None)`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = self.txn.open_table(TABLE)?;
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut table = self.txn.open_table(TABLE)?;
        table.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut table = self.txn.open_table(TABLE)?;
        table.remove(key)?;
        Ok(())
    }

    /// Commit the pending writes. Resources (including the serial lock, if
    /// held) are released whether or not the commit succeeds.
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}
