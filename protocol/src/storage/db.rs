//! # CommanderDb — Persistent Storage Engine
//!
//! The persistence layer for the commander, built on sled's embedded
//! key-value store. Every tree node, leaf, batch and queued transaction
//! lives in a single sled tree, namespaced by a one-byte [`Keyspace`] tag.
//!
//! ## Key Layout
//!
//! | Keyspace         | Suffix                         | Value                  |
//! |------------------|--------------------------------|------------------------|
//! | `StateLeaf`      | `stateID` (4B BE)              | `bincode(UserState)`   |
//! | `StateNode`      | `depth` (1B) ‖ `path` (4B BE)  | node hash (32B)        |
//! | `AccountLeaf`    | `pubKeyID` (4B BE)             | `bincode(AccountLeaf)` |
//! | `AccountNode`    | `depth` (1B) ‖ `path` (4B BE)  | node hash (32B)        |
//! | `StateUpdate`    | `seq` (8B BE)                  | `bincode(StateUpdate)` |
//! | `Batch`          | `batchID` (8B BE)              | `bincode(Batch)`       |
//! | `MempoolTx`      | `stateID` ‖ `nonce` (32B BE)   | `bincode(PendingTx)`   |
//! | `Meta`           | UTF-8 name                     | `bincode(value)`       |
//!
//! Integers are big-endian so sled's lexicographic order is numeric order.
//!
//! ## Atomicity
//!
//! Mutation goes through a [`WriteTxn`] guard. Writes are staged in an
//! in-memory overlay that the guard's own reads see, and land in sled as a
//! single atomic `Batch` on [`WriteTxn::commit`]. Dropping the guard without
//! committing discards the overlay: that is the rollback path, and it is the
//! only one. Core logic never decides commit semantics itself, it just
//! returns an error and lets the guard fall out of scope.
//!
//! Only one `WriteTxn` can exist at a time (a process-wide writer mutex).
//! Readers take a [`ReadView`], which holds a shared gate that commits
//! take exclusively while the batch is applied, so a reader observes a unit
//! of work either completely or not at all.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Db, Tree};
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted record under {0}")]
    Corrupted(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Keyspaces
// ---------------------------------------------------------------------------

/// One-byte namespace tag prefixed to every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Keyspace {
    Meta = 0x00,
    StateLeaf = 0x01,
    StateNode = 0x02,
    AccountLeaf = 0x03,
    AccountNode = 0x04,
    /// `keccak(publicKey)` ‖ `pubKeyID` → `()`
    AccountByKey = 0x05,
    StateUpdate = 0x06,
    /// `pubKeyID` ‖ `stateID` → `()`
    StateByPubKey = 0x07,
    Batch = 0x08,
    /// tx hash → `CommitmentId`
    TxReceipt = 0x09,
    MempoolTx = 0x0a,
    /// tx hash → `(stateID, nonce)`
    MempoolHash = 0x0b,
    PendingState = 0x0c,
    Spoke = 0x0d,
    /// tx hash → error message
    FailedTx = 0x0e,
}

impl Keyspace {
    /// Full key for `suffix` in this keyspace.
    pub fn key(self, suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + suffix.len());
        key.push(self as u8);
        key.extend_from_slice(suffix);
        key
    }

    /// Prefix matching every key of this keyspace.
    pub fn prefix(self) -> Vec<u8> {
        vec![self as u8]
    }
}

pub type KvPair = (Vec<u8>, Vec<u8>);
pub type KvIter<'a> = Box<dyn Iterator<Item = StorageResult<KvPair>> + 'a>;

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Read / Write traits
// ---------------------------------------------------------------------------

/// Read access to the key-value store.
///
/// Implemented by [`ReadView`] (committed state) and [`WriteTxn`] (committed
/// state plus the transaction's own staged writes), so tree and mempool code
/// is written once and works against either.
pub trait KvRead {
    fn get_raw(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Iterate all pairs whose key starts with `prefix`, in key order.
    fn scan_raw(&self, prefix: &[u8]) -> KvIter<'_>;

    fn get_value<T: DeserializeOwned>(&self, key: &[u8]) -> StorageResult<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn contains(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get_raw(key)?.is_some())
    }
}

/// Write access. Only [`WriteTxn`] implements it.
pub trait KvWrite: KvRead {
    fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>);

    fn delete(&mut self, key: &[u8]);

    fn put_value<T: Serialize + ?Sized>(&mut self, key: Vec<u8>, value: &T) -> StorageResult<()> {
        let bytes = encode(value)?;
        self.put_raw(key, bytes);
        Ok(())
    }
}

impl<T: KvRead + ?Sized> KvRead for &T {
    fn get_raw(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        (**self).get_raw(key)
    }

    fn scan_raw(&self, prefix: &[u8]) -> KvIter<'_> {
        (**self).scan_raw(prefix)
    }
}

impl<T: KvRead + ?Sized> KvRead for &mut T {
    fn get_raw(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        (**self).get_raw(key)
    }

    fn scan_raw(&self, prefix: &[u8]) -> KvIter<'_> {
        (**self).scan_raw(prefix)
    }
}

impl<T: KvWrite + ?Sized> KvWrite for &mut T {
    fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        (**self).put_raw(key, value)
    }

    fn delete(&mut self, key: &[u8]) {
        (**self).delete(key)
    }
}

// ---------------------------------------------------------------------------
// CommanderDb
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Locks {
    /// Single-writer lock, held for the lifetime of a `WriteTxn`.
    writer: Mutex<()>,
    /// Shared by readers, exclusive while a commit batch is applied.
    commit_gate: RwLock<()>,
}

/// Persistent storage for the commander.
///
/// Cheap to clone; clones share the sled handle and the writer lock.
#[derive(Debug, Clone)]
pub struct CommanderDb {
    db: Db,
    data: Tree,
    locks: Arc<Locks>,
    flush_on_commit: bool,
}

impl CommanderDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db, true)
    }

    /// Create a temporary database that is removed when dropped.
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, false)
    }

    fn from_db(db: Db, flush_on_commit: bool) -> StorageResult<Self> {
        let data = db.open_tree("commander")?;
        Ok(Self {
            db,
            data,
            locks: Arc::new(Locks::default()),
            flush_on_commit,
        })
    }

    /// Begin the (single) read-write transaction, blocking until any other
    /// writer has committed or rolled back.
    pub fn begin(&self) -> WriteTxn<'_> {
        let writer = self.locks.writer.lock();
        trace!("write transaction started");
        WriteTxn {
            db: self,
            _writer: writer,
            overlay: BTreeMap::new(),
            committed: false,
        }
    }

    /// Open a consistent read-only view of committed state.
    pub fn read(&self) -> ReadView<'_> {
        ReadView {
            data: &self.data,
            _gate: self.locks.commit_gate.read(),
        }
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of stored records, across all keyspaces.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn scan_tree<'a>(tree: &'a Tree, prefix: &[u8]) -> KvIter<'a> {
    Box::new(tree.scan_prefix(prefix).map(|item| {
        item.map(|(k, v)| (k.to_vec(), v.to_vec()))
            .map_err(StorageError::from)
    }))
}

// ---------------------------------------------------------------------------
// ReadView
// ---------------------------------------------------------------------------

/// Read-only view of committed state. Holding it delays commits, so keep
/// it short-lived and never open a `WriteTxn` commit while holding one.
pub struct ReadView<'a> {
    data: &'a Tree,
    _gate: RwLockReadGuard<'a, ()>,
}

impl KvRead for ReadView<'_> {
    fn get_raw(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.get(key)?.map(|v| v.to_vec()))
    }

    fn scan_raw(&self, prefix: &[u8]) -> KvIter<'_> {
        scan_tree(self.data, prefix)
    }
}

// ---------------------------------------------------------------------------
// WriteTxn
// ---------------------------------------------------------------------------

/// Snapshot of a transaction's staged writes, used to undo part of a unit
/// of work (for example a commitment that ends up too small) without
/// abandoning the whole transaction.
#[derive(Debug, Clone)]
pub struct Checkpoint(BTreeMap<Vec<u8>, Option<Vec<u8>>>);

/// Scoped read-write transaction.
///
/// `commit()` applies every staged write atomically. Dropping the guard
/// without committing rolls everything back.
pub struct WriteTxn<'a> {
    db: &'a CommanderDb,
    _writer: MutexGuard<'a, ()>,
    /// `None` marks a deletion.
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    committed: bool,
}

impl WriteTxn<'_> {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.overlay.clone())
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.overlay = checkpoint.0;
    }

    /// Number of staged key writes (including deletions).
    pub fn staged(&self) -> usize {
        self.overlay.len()
    }

    /// Atomically apply all staged writes.
    pub fn commit(mut self) -> StorageResult<()> {
        let overlay = std::mem::take(&mut self.overlay);
        let writes = overlay.len();

        let mut batch = Batch::default();
        for (key, value) in overlay {
            match value {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
        }

        {
            let _gate = self.db.locks.commit_gate.write();
            self.db.data.apply_batch(batch)?;
        }
        if self.db.flush_on_commit {
            self.db.db.flush()?;
        }

        self.committed = true;
        trace!(writes, "write transaction committed");
        Ok(())
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.overlay.is_empty() {
            debug!(
                discarded = self.overlay.len(),
                "write transaction rolled back"
            );
        }
    }
}

impl KvRead for WriteTxn<'_> {
    fn get_raw(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        match self.overlay.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.db.data.get(key)?.map(|v| v.to_vec())),
        }
    }

    fn scan_raw(&self, prefix: &[u8]) -> KvIter<'_> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in self.db.data.scan_prefix(prefix) {
            match item {
                Ok((k, v)) => {
                    merged.insert(k.to_vec(), v.to_vec());
                }
                Err(e) => return Box::new(std::iter::once(Err(StorageError::from(e)))),
            }
        }
        let staged = self
            .overlay
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix));
        for (k, v) in staged {
            match v {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        Box::new(merged.into_iter().map(Ok))
    }
}

impl KvWrite for WriteTxn<'_> {
    fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert(key, Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.overlay.insert(key.to_vec(), None);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn k(space: Keyspace, n: u32) -> Vec<u8> {
        space.key(&n.to_be_bytes())
    }

    #[test]
    fn open_temporary_database() {
        let db = CommanderDb::open_temporary().expect("temp db");
        assert!(db.is_empty());
    }

    #[test]
    fn open_persistent_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = CommanderDb::open(dir.path()).expect("open");
            let mut txn = db.begin();
            txn.put_value(k(Keyspace::Meta, 1), &42u64).unwrap();
            txn.commit().unwrap();
        }
        let db = CommanderDb::open(dir.path()).expect("reopen");
        let v: Option<u64> = db.read().get_value(&k(Keyspace::Meta, 1)).unwrap();
        assert_eq!(v, Some(42));
    }

    #[test]
    fn commit_makes_writes_visible() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        txn.put_raw(k(Keyspace::StateLeaf, 1), vec![1]);
        assert_eq!(txn.get_raw(&k(Keyspace::StateLeaf, 1)).unwrap(), Some(vec![1]));
        // Not visible outside the transaction yet.
        assert!(db.data.get(k(Keyspace::StateLeaf, 1)).unwrap().is_none());
        txn.commit().unwrap();

        assert_eq!(
            db.read().get_raw(&k(Keyspace::StateLeaf, 1)).unwrap(),
            Some(vec![1])
        );
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let db = CommanderDb::open_temporary().unwrap();
        {
            let mut txn = db.begin();
            txn.put_raw(k(Keyspace::StateLeaf, 1), vec![1]);
        }
        assert!(db.read().get_raw(&k(Keyspace::StateLeaf, 1)).unwrap().is_none());
    }

    #[test]
    fn error_inside_unit_of_work_rolls_back() {
        fn failing_work(txn: &mut WriteTxn<'_>) -> Result<(), &'static str> {
            txn.put_raw(Keyspace::Meta.key(b"a"), vec![1]);
            Err("boom")
        }

        let db = CommanderDb::open_temporary().unwrap();
        let result = {
            let mut txn = db.begin();
            failing_work(&mut txn).map(|_| txn)
        };
        assert!(result.is_err());
        assert!(db.read().get_raw(&Keyspace::Meta.key(b"a")).unwrap().is_none());
    }

    #[test]
    fn deletes_are_staged_and_applied() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        txn.put_raw(k(Keyspace::Batch, 1), vec![1]);
        txn.commit().unwrap();

        let mut txn = db.begin();
        txn.delete(&k(Keyspace::Batch, 1));
        assert!(txn.get_raw(&k(Keyspace::Batch, 1)).unwrap().is_none());
        txn.commit().unwrap();
        assert!(db.read().get_raw(&k(Keyspace::Batch, 1)).unwrap().is_none());
    }

    #[test]
    fn scan_merges_overlay_with_committed_state() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        for i in 0..4 {
            txn.put_raw(k(Keyspace::MempoolTx, i), vec![i as u8]);
        }
        txn.put_raw(k(Keyspace::Batch, 0), vec![99]);
        txn.commit().unwrap();

        let mut txn = db.begin();
        txn.delete(&k(Keyspace::MempoolTx, 1));
        txn.put_raw(k(Keyspace::MempoolTx, 9), vec![9]);
        txn.put_raw(k(Keyspace::MempoolTx, 2), vec![22]);

        let values: Vec<u8> = txn
            .scan_raw(&Keyspace::MempoolTx.prefix())
            .map(|r| r.unwrap().1[0])
            .collect();
        assert_eq!(values, vec![0, 22, 3, 9]);
    }

    #[test]
    fn checkpoint_restore_undoes_partial_work() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        txn.put_raw(k(Keyspace::Meta, 1), vec![1]);
        let cp = txn.checkpoint();
        txn.put_raw(k(Keyspace::Meta, 2), vec![2]);
        txn.restore(cp);
        assert!(txn.get_raw(&k(Keyspace::Meta, 2)).unwrap().is_none());
        assert!(txn.get_raw(&k(Keyspace::Meta, 1)).unwrap().is_some());
    }

    #[test]
    fn writers_are_serialized() {
        let db = CommanderDb::open_temporary().unwrap();
        let in_critical = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..4u32)
            .map(|i| {
                let db = db.clone();
                let flag = Arc::clone(&in_critical);
                thread::spawn(move || {
                    for j in 0..20u32 {
                        let mut txn = db.begin();
                        assert!(!flag.swap(true, Ordering::SeqCst), "two writers at once");
                        txn.put_raw(k(Keyspace::Meta, i * 100 + j), vec![0]);
                        flag.store(false, Ordering::SeqCst);
                        txn.commit().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(db.len(), 80);
    }

    #[test]
    fn readers_never_see_half_a_commit() {
        let db = CommanderDb::open_temporary().unwrap();
        let writer_db = db.clone();

        let writer = thread::spawn(move || {
            for round in 1..=50u8 {
                let mut txn = writer_db.begin();
                txn.put_raw(Keyspace::Meta.key(b"a"), vec![round]);
                txn.put_raw(Keyspace::Meta.key(b"b"), vec![round]);
                txn.commit().unwrap();
            }
        });

        for _ in 0..200 {
            let view = db.read();
            let a = view.get_raw(&Keyspace::Meta.key(b"a")).unwrap();
            let b = view.get_raw(&Keyspace::Meta.key(b"b")).unwrap();
            assert_eq!(a, b);
        }
        writer.join().unwrap();
    }
}
