//! Background reaper of the MemDAG: vertices that stayed unreferenced for a
//! full grace period are tombstoned and dropped from the map together with
//! their cached state readers.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use crate::config::LedgerParams;
use crate::memdag::MemDag;
use crate::vertex::WrappedTx;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub num_vertices: usize,
    pub deleted: usize,
    pub readers_purged: usize,
    pub readers_left: usize,
    /// Histogram of per-vertex reference counts; the last bucket collects
    /// everything above.
    pub ref_stats: [u32; 6],
}

pub struct Pruner {
    dag: Arc<MemDag>,
    params: LedgerParams,
}

impl Pruner {
    pub fn new(dag: Arc<MemDag>, params: LedgerParams) -> Self {
        Self { dag, params }
    }

    /// One sweep: collect expired vertices, purge them and the orphaned
    /// state readers. Public so tests can run sweeps without the timer.
    pub fn prune_once(&self) -> PruneStats {
        let grace = self.params.prune_grace();
        let now = Instant::now();
        let mut stats = PruneStats::default();
        let mut to_delete: Vec<Arc<WrappedTx>> = Vec::new();

        for vid in self.dag.all_vertices() {
            let refs = vid.references() as usize;
            let bucket = refs.min(stats.ref_stats.len() - 1);
            stats.ref_stats[bucket] += 1;
            if vid.do_pruning_if_relevant(now, grace) {
                debug!(vertex = %vid.id(), "marked for deletion");
                to_delete.push(vid);
            }
        }
        stats.deleted = to_delete.len();
        self.dag.purge_deleted_vertices(&to_delete);
        let (readers_purged, readers_left) = self.dag.purge_cached_state_readers();
        stats.readers_purged = readers_purged;
        stats.readers_left = readers_left;
        stats.num_vertices = self.dag.num_vertices();
        stats
    }

    pub fn start(self, mut cancel: watch::Receiver<bool>) -> JoinHandle<()> {
        info!("starting MemDAG pruner");
        tokio::spawn(async move {
            let mut ticker = time::interval(self.params.prune_loop_period());
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // the first tick of an interval fires immediately; skip it so a
            // fresh node does not sweep at startup
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {}
                }
                if *cancel.borrow() {
                    break;
                }
                let stats = self.prune_once();
                info!(
                    vertices = stats.num_vertices,
                    deleted = stats.deleted,
                    readers_purged = stats.readers_purged,
                    readers_left = stats.readers_left,
                    ref_stats = ?stats.ref_stats,
                    "memDAG pruner sweep"
                );
            }
            debug!("MemDAG pruner stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::{Lock, Output, Slot, Transaction, CHAIN_ORIGIN};

    fn test_setup(grace_slots: u32) -> (tempfile::TempDir, Arc<MemDag>, Pruner) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).unwrap();
        let dag = Arc::new(MemDag::new(storage, 4));
        let params = LedgerParams {
            slot_duration_ms: 0,
            prune_grace_slots: grace_slots,
            ..LedgerParams::default()
        };
        (dir, dag.clone(), Pruner::new(dag, params))
    }

    fn vertex() -> Arc<WrappedTx> {
        WrappedTx::new_full(Transaction {
            slot: Slot::ZERO,
            sequencer_id: Some(CHAIN_ORIGIN),
            stem_input: None,
            inputs: Vec::new(),
            endorsements: Vec::new(),
            outputs: vec![Output::new(1, Lock::Stem).with_chain(CHAIN_ORIGIN)],
            inflation: 0,
        })
    }

    #[test]
    fn unreferenced_vertices_are_swept() {
        let (_dir, dag, pruner) = test_setup(0);
        let vid = vertex();
        let txid = vid.id();
        dag.with_global_write_lock(|access| access.add_vertex_no_lock(vid.clone()));

        // an external holder keeps it alive through the first sweep
        assert!(vid.try_reference());
        let stats = pruner.prune_once();
        assert_eq!(stats.deleted, 0);
        assert!(dag.get_vertex(&txid).is_some());

        // the last external reference goes, the next sweep reclaims it
        vid.release();
        let stats = pruner.prune_once();
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.num_vertices, 0);
        assert!(dag.get_vertex(&txid).is_none());
        assert!(vid.is_deleted());
    }

    #[test]
    fn referenced_vertices_survive_sweeps() {
        let (_dir, dag, pruner) = test_setup(0);
        let vid = vertex();
        dag.with_global_write_lock(|access| access.add_vertex_no_lock(vid.clone()));
        assert!(vid.try_reference());

        for _ in 0..3 {
            let stats = pruner.prune_once();
            assert_eq!(stats.deleted, 0);
        }
        assert!(dag.get_vertex(&vid.id()).is_some());
        // the histogram sees the map reference plus the external one
        let stats = pruner.prune_once();
        assert_eq!(stats.ref_stats[2], 1);
    }
}
