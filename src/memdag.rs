//! Process-wide map from transaction id to wrapped vertex, the branch index
//! and the cache of per-branch state readers. One coarse reader/writer lock
//! orders all structural mutations; per-vertex state has its own locks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::errors::{TangleError, TangleResult};
use crate::multistate::{fetch_root_record, Readable};
use crate::storage::Storage;
use crate::types::TransactionId;
use crate::vertex::WrappedTx;

struct CachedStateReader {
    branch: Arc<WrappedTx>,
    reader: Arc<Readable>,
    last_used: u64,
}

struct DagInner {
    vertices: HashMap<TransactionId, Arc<WrappedTx>>,
    branches: HashMap<TransactionId, Arc<WrappedTx>>,
    state_readers: HashMap<TransactionId, CachedStateReader>,
    clock: u64,
}

pub struct MemDag {
    storage: Storage,
    reader_cache_capacity: usize,
    inner: RwLock<DagInner>,
}

/// Mutable view handed out by [`MemDag::with_global_write_lock`]; the
/// `*_no_lock` operations live here so they cannot run outside the lock.
pub struct DagAccess<'a> {
    inner: &'a mut DagInner,
}

impl<'a> DagAccess<'a> {
    pub fn get_vertex_no_lock(&self, txid: &TransactionId) -> Option<Arc<WrappedTx>> {
        self.inner.vertices.get(txid).cloned()
    }

    pub fn add_vertex_no_lock(&mut self, vid: Arc<WrappedTx>) {
        self.inner.vertices.insert(vid.id(), vid);
    }

    pub fn add_branch_no_lock(&mut self, vid: Arc<WrappedTx>) {
        self.inner.branches.insert(vid.id(), vid.clone());
        self.inner.vertices.entry(vid.id()).or_insert(vid);
    }
}

impl MemDag {
    pub fn new(storage: Storage, reader_cache_capacity: usize) -> Self {
        Self {
            storage,
            reader_cache_capacity: reader_cache_capacity.max(1),
            inner: RwLock::new(DagInner {
                vertices: HashMap::new(),
                branches: HashMap::new(),
                state_readers: HashMap::new(),
                clock: 0,
            }),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn with_global_write_lock<R>(&self, f: impl FnOnce(&mut DagAccess<'_>) -> R) -> R {
        let mut inner = self.inner.write();
        f(&mut DagAccess { inner: &mut inner })
    }

    pub fn get_vertex(&self, txid: &TransactionId) -> Option<Arc<WrappedTx>> {
        self.inner.read().vertices.get(txid).cloned()
    }

    pub fn get_branch(&self, txid: &TransactionId) -> Option<Arc<WrappedTx>> {
        self.inner.read().branches.get(txid).cloned()
    }

    pub fn num_vertices(&self) -> usize {
        self.inner.read().vertices.len()
    }

    pub fn num_state_readers(&self) -> usize {
        self.inner.read().state_readers.len()
    }

    /// Snapshot of the vertex set, optionally filtered by id.
    pub fn vertices<F>(&self, filter: Option<F>) -> Vec<Arc<WrappedTx>>
    where
        F: Fn(&TransactionId) -> bool,
    {
        let inner = self.inner.read();
        match filter {
            Some(f) => inner
                .vertices
                .values()
                .filter(|vid| f(&vid.id()))
                .cloned()
                .collect(),
            None => inner.vertices.values().cloned().collect(),
        }
    }

    pub fn all_vertices(&self) -> Vec<Arc<WrappedTx>> {
        self.vertices::<fn(&TransactionId) -> bool>(None)
    }

    /// Removes tombstoned vertices from the maps and drops their cached
    /// state readers.
    pub fn purge_deleted_vertices(&self, deleted: &[Arc<WrappedTx>]) {
        let mut inner = self.inner.write();
        for vid in deleted {
            let txid = vid.id();
            inner.vertices.remove(&txid);
            inner.branches.remove(&txid);
            inner.state_readers.remove(&txid);
        }
    }

    /// The cached state reader rooted at the branch's committed state,
    /// lazily built from the persisted root record.
    pub fn get_state_reader_for_the_branch(
        &self,
        branch: &Arc<WrappedTx>,
    ) -> TangleResult<Arc<Readable>> {
        let mut inner = self.inner.write();
        inner.clock += 1;
        let now = inner.clock;
        if let Some(cached) = inner.state_readers.get_mut(&branch.id()) {
            cached.last_used = now;
            return Ok(cached.reader.clone());
        }
        let record = fetch_root_record(&self.storage, &branch.id())?.ok_or_else(|| {
            TangleError::NotFound(format!("no root record for branch {}", branch.id()))
        })?;
        let reader = Arc::new(Readable::new(Arc::new(self.storage.clone()), record.root));
        trace!(branch = %branch.id(), root = %record.root, "caching state reader");
        inner.state_readers.insert(
            branch.id(),
            CachedStateReader {
                branch: branch.clone(),
                reader: reader.clone(),
                last_used: now,
            },
        );
        self.evict_readers_over_capacity(&mut inner);
        Ok(reader.clone())
    }

    /// Drops cached readers whose backing branch vertex is gone or
    /// unreferenced, then trims to capacity. Returns (purged, left).
    pub fn purge_cached_state_readers(&self) -> (usize, usize) {
        let mut inner = self.inner.write();
        let before = inner.state_readers.len();
        inner
            .state_readers
            .retain(|_, cached| !cached.branch.is_deleted() && cached.branch.references() > 0);
        self.evict_readers_over_capacity(&mut inner);
        let left = inner.state_readers.len();
        (before - left, left)
    }

    fn evict_readers_over_capacity(&self, inner: &mut DagInner) {
        while inner.state_readers.len() > self.reader_cache_capacity {
            let Some(oldest) = inner
                .state_readers
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(txid, _)| *txid)
            else {
                break;
            };
            inner.state_readers.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multistate::{Mutations, RootRecordParams, Updatable};
    use crate::types::{ChainId, Commitment, Lock, Output, Slot, Transaction, CHAIN_ORIGIN};

    fn test_dag(capacity: usize) -> (tempfile::TempDir, MemDag) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).unwrap();
        (dir, MemDag::new(storage, capacity))
    }

    fn branch_tx(amount: u64) -> Transaction {
        Transaction {
            slot: Slot::ZERO,
            sequencer_id: Some(CHAIN_ORIGIN),
            stem_input: None,
            inputs: Vec::new(),
            endorsements: Vec::new(),
            outputs: vec![Output::new(amount, Lock::Stem).with_chain(CHAIN_ORIGIN)],
            inflation: 0,
        }
    }

    fn commit_branch(storage: &Storage, tx: &Transaction) {
        let mut updatable = Updatable::new(storage.clone(), Commitment::EMPTY);
        let mut mutations = Mutations::new();
        for (oid, out) in tx.produced_outputs() {
            mutations.insert_output(oid, out.clone());
        }
        mutations.insert_committed_transaction(tx.id(), tx.slot);
        let params = RootRecordParams {
            branch: tx.id(),
            sequencer_id: ChainId([1u8; 32]),
            ledger_coverage: tx.outputs[0].amount,
            slot_inflation: 0,
            supply: tx.outputs[0].amount,
            num_transactions: 1,
        };
        updatable.apply(&mutations, Some(&params)).unwrap();
    }

    #[test]
    fn vertex_lookup_through_the_global_lock() {
        let (_dir, dag) = test_dag(4);
        let vid = WrappedTx::new_full(branch_tx(5));
        let txid = vid.id();
        dag.with_global_write_lock(|access| {
            assert!(access.get_vertex_no_lock(&txid).is_none());
            access.add_branch_no_lock(vid.clone());
        });
        assert!(dag.get_vertex(&txid).is_some());
        assert!(dag.get_branch(&txid).is_some());
        assert_eq!(dag.num_vertices(), 1);

        dag.purge_deleted_vertices(&[vid]);
        assert!(dag.get_vertex(&txid).is_none());
        assert!(dag.get_branch(&txid).is_none());
    }

    #[test]
    fn state_reader_is_cached_and_purged() {
        let (_dir, dag) = test_dag(4);
        let tx = branch_tx(100);
        commit_branch(dag.storage(), &tx);

        let branch = WrappedTx::new_full(tx);
        dag.with_global_write_lock(|access| access.add_branch_no_lock(branch.clone()));

        let reader = dag.get_state_reader_for_the_branch(&branch).unwrap();
        let again = dag.get_state_reader_for_the_branch(&branch).unwrap();
        assert!(Arc::ptr_eq(&reader, &again));
        assert_eq!(dag.num_state_readers(), 1);

        // readers of unreferenced branches are dropped by the purge
        branch.release();
        let (purged, left) = dag.purge_cached_state_readers();
        assert_eq!((purged, left), (1, 0));
    }

    #[test]
    fn reader_cache_evicts_least_recently_used() {
        let (_dir, dag) = test_dag(2);
        let txs: Vec<Transaction> = (1u64..=3).map(branch_tx).collect();
        let mut branches = Vec::new();
        for tx in &txs {
            commit_branch(dag.storage(), tx);
            let vid = WrappedTx::new_full(tx.clone());
            dag.with_global_write_lock(|access| access.add_branch_no_lock(vid.clone()));
            branches.push(vid);
        }
        dag.get_state_reader_for_the_branch(&branches[0]).unwrap();
        dag.get_state_reader_for_the_branch(&branches[1]).unwrap();
        dag.get_state_reader_for_the_branch(&branches[2]).unwrap();
        assert_eq!(dag.num_state_readers(), 2);

        // the first reader was the least recently used one
        let inner_has_first = dag
            .get_state_reader_for_the_branch(&branches[0])
            .map(|_| dag.num_state_readers())
            .unwrap();
        assert_eq!(inner_has_first, 2);
    }

    #[test]
    fn missing_root_record_is_an_error() {
        let (_dir, dag) = test_dag(4);
        let branch = WrappedTx::new_full(branch_tx(1));
        let err = dag.get_state_reader_for_the_branch(&branch).unwrap_err();
        assert!(matches!(err, TangleError::NotFound(_)));
    }
}
