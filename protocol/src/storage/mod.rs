//! # Storage Module
//!
//! Everything the commander persists, on one sled database.
//!
//! ## Architecture
//!
//! ```text
//! db.rs           — sled handle, keyspaces, scoped write transactions
//! state_tree.rs   — balances and nonces keyed by state ID
//! account_tree.rs — BLS public keys keyed by pubkey ID
//! batches.rs      — batches, commitments, receipts and failed transactions
//! ```
//!
//! The trees are the canonical ledger. Batches and receipts describe how
//! the ledger got there and what must be undone when the base chain
//! disputes a batch.

pub mod account_tree;
pub mod batches;
pub mod db;
pub mod state_tree;

pub use account_tree::{AccountLeaf, AccountTree};
pub use batches::BatchStore;
pub use db::{CommanderDb, KvRead, KvWrite, Keyspace, ReadView, StorageError, WriteTxn};
pub use state_tree::{StateTree, UserState};

use crate::error::CommanderResult;

/// Key of a named singleton record.
pub(crate) fn meta_key(name: &str) -> Vec<u8> {
    Keyspace::Meta.key(name.as_bytes())
}

fn spoke_key(spoke_id: u32) -> Vec<u8> {
    Keyspace::Spoke.key(&spoke_id.to_be_bytes())
}

/// Whether `spoke_id` was registered as a mass-migration destination.
pub fn spoke_exists<S: KvRead>(store: &S, spoke_id: u32) -> CommanderResult<bool> {
    Ok(store.contains(&spoke_key(spoke_id))?)
}

/// Register a mass-migration destination. Registering twice is a no-op.
pub fn register_spoke<S: KvWrite>(store: &mut S, spoke_id: u32) -> CommanderResult<bool> {
    if spoke_exists(store, spoke_id)? {
        return Ok(false);
    }
    store.put_raw(spoke_key(spoke_id), Vec::new());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spokes_register_once() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        assert!(!spoke_exists(&txn, 3).unwrap());
        assert!(register_spoke(&mut txn, 3).unwrap());
        assert!(!register_spoke(&mut txn, 3).unwrap());
        txn.commit().unwrap();
        assert!(spoke_exists(&db.read(), 3).unwrap());
    }
}
