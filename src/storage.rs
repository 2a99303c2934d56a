use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::errors::{TangleError, TangleResult};
use crate::trie::NodeSource;
use crate::types::{Commitment, Slot, TransactionId};

pub(crate) const CF_TRIE: &str = "trie";
pub(crate) const CF_ROOTS: &str = "roots";
pub(crate) const CF_META: &str = "meta";
pub(crate) const CF_TXBYTES: &str = "txbytes";

const LATEST_SLOT_KEY: &[u8] = b"latest_committed_slot";

/// Persistent key/value engine under the multi-state layer: trie nodes, root
/// records per branch, the latest-committed-slot singleton and the raw
/// tx-bytes store.
#[derive(Clone)]
pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Storage {
    pub fn open(path: &Path) -> TangleResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TRIE, Options::default()),
            ColumnFamilyDescriptor::new(CF_ROOTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
            ColumnFamilyDescriptor::new(CF_TXBYTES, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> TangleResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| TangleError::Config(format!("missing column family {name}")))
    }

    /// True while no branch state has ever been committed: the genesis
    /// emission is only accepted against this.
    pub fn has_no_committed_state(&self) -> TangleResult<bool> {
        let cf = self.cf(CF_ROOTS)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        Ok(iter.next().transpose()?.is_none())
    }

    pub fn fetch_root_record_bytes(&self, branch: &TransactionId) -> TangleResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_ROOTS)?;
        Ok(self.db.get_cf(&cf, branch.as_bytes())?)
    }

    /// Iterates all persisted root records; the callback returns false to
    /// stop early.
    pub fn iterate_root_records<F>(&self, mut f: F) -> TangleResult<()>
    where
        F: FnMut(TransactionId, &[u8]) -> bool,
    {
        let cf = self.cf(CF_ROOTS)?;
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let txid = TransactionId::from_bytes(&key)?;
            if !f(txid, &value) {
                break;
            }
        }
        Ok(())
    }

    pub fn latest_committed_slot(&self) -> TangleResult<Option<Slot>> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, LATEST_SLOT_KEY)? {
            Some(raw) => Ok(Some(Slot::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn store_tx_bytes_with_metadata(
        &self,
        txid: &TransactionId,
        blob: &[u8],
    ) -> TangleResult<()> {
        let cf = self.cf(CF_TXBYTES)?;
        self.db.put_cf(&cf, txid.as_bytes(), blob)?;
        Ok(())
    }

    pub fn get_tx_bytes_with_metadata(&self, txid: &TransactionId) -> TangleResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_TXBYTES)?;
        Ok(self.db.get_cf(&cf, txid.as_bytes())?)
    }

    pub fn has_tx_bytes(&self, txid: &TransactionId) -> TangleResult<bool> {
        Ok(self.get_tx_bytes_with_metadata(txid)?.is_some())
    }

    /// Opens an atomic batch for a state commit. Everything staged on the
    /// batch lands in one engine write or not at all.
    pub fn state_batch(&self) -> StateBatch<'_> {
        StateBatch {
            storage: self,
            batch: WriteBatch::default(),
        }
    }
}

impl NodeSource for Storage {
    fn load_node(&self, commitment: &Commitment) -> TangleResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_TRIE)?;
        Ok(self.db.get_cf(&cf, commitment.as_bytes())?)
    }
}

/// Batched writer for a single state commit: trie delta, root record and the
/// latest-slot marker, all-or-nothing.
pub struct StateBatch<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
}

impl<'a> StateBatch<'a> {
    pub fn put_trie_node(&mut self, commitment: &Commitment, encoded: &[u8]) -> TangleResult<()> {
        let cf = self.storage.cf(CF_TRIE)?;
        self.batch.put_cf(&cf, commitment.as_bytes(), encoded);
        Ok(())
    }

    pub fn put_root_record(&mut self, branch: &TransactionId, encoded: &[u8]) -> TangleResult<()> {
        let cf = self.storage.cf(CF_ROOTS)?;
        self.batch.put_cf(&cf, branch.as_bytes(), encoded);
        Ok(())
    }

    pub fn put_latest_slot(&mut self, slot: Slot) -> TangleResult<()> {
        let cf = self.storage.cf(CF_META)?;
        self.batch.put_cf(&cf, LATEST_SLOT_KEY, slot.to_bytes());
        Ok(())
    }

    pub fn commit(self) -> TangleResult<()> {
        self.storage.db.write(self.batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_column_families() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.has_no_committed_state().unwrap());
        assert_eq!(storage.latest_committed_slot().unwrap(), None);
    }

    #[test]
    fn tx_bytes_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).unwrap();
        let txid = TransactionId([7u8; 32]);
        assert!(!storage.has_tx_bytes(&txid).unwrap());
        storage.store_tx_bytes_with_metadata(&txid, b"blob").unwrap();
        assert_eq!(
            storage.get_tx_bytes_with_metadata(&txid).unwrap(),
            Some(b"blob".to_vec())
        );
    }

    #[test]
    fn state_batch_is_atomic_per_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).unwrap();
        let branch = TransactionId([1u8; 32]);
        let node = Commitment([2u8; 32]);

        let mut batch = storage.state_batch();
        batch.put_trie_node(&node, b"node").unwrap();
        batch.put_root_record(&branch, b"record").unwrap();
        batch.put_latest_slot(Slot(3)).unwrap();
        batch.commit().unwrap();

        assert_eq!(storage.load_node(&node).unwrap(), Some(b"node".to_vec()));
        assert_eq!(
            storage.fetch_root_record_bytes(&branch).unwrap(),
            Some(b"record".to_vec())
        );
        assert_eq!(storage.latest_committed_slot().unwrap(), Some(Slot(3)));
        assert!(!storage.has_no_committed_state().unwrap());
    }
}
