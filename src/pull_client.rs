//! Periodic retry queue for transactions the tangle is missing. Each wanted
//! id is re-requested from one random peer every repull period; ids stuck for
//! too long are broadcast to all peers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::LedgerParams;
use crate::types::TransactionId;

/// What the pull client needs from the node: the local tx-bytes store
/// short-circuit and the peer fan-out.
pub trait PullClientEnvironment: Send + Sync + 'static {
    /// Raw `metadata || tx bytes` blob when the transaction is already stored
    /// locally.
    fn stored_tx_bytes(&self, txid: &TransactionId) -> Option<Vec<u8>>;
    /// Re-injects locally found bytes into the workflow input.
    fn reinject_from_store(&self, blob: Vec<u8>);
    /// Sends a pull request to one random alive peer with a tx store.
    /// Returns false when no such peer exists.
    fn pull_from_random_peer(&self, txids: &[TransactionId]) -> bool;
    fn pull_from_all_peers(&self, txids: &[TransactionId]);
}

struct PullRecord {
    start: Instant,
    next_deadline: Instant,
}

pub struct PullClient {
    env: Arc<dyn PullClientEnvironment>,
    params: LedgerParams,
    pull_list: Mutex<HashMap<TransactionId, PullRecord>>,
}

impl PullClient {
    pub fn new(env: Arc<dyn PullClientEnvironment>, params: LedgerParams) -> Arc<Self> {
        Arc::new(Self {
            env,
            params,
            pull_list: Mutex::new(HashMap::new()),
        })
    }

    /// Starts pulling `txid`. Bytes already in the local store loop straight
    /// back into the workflow instead of going to the peers.
    pub fn pull(&self, txid: TransactionId, by: &str) {
        if self.pull_list.lock().contains_key(&txid) {
            return;
        }
        if let Some(blob) = self.env.stored_tx_bytes(&txid) {
            debug!(%txid, "fetched from the tx-bytes store");
            self.env.reinject_from_store(blob);
            return;
        }
        let now = Instant::now();
        {
            let mut list = self.pull_list.lock();
            list.insert(
                txid,
                PullRecord {
                    start: now,
                    next_deadline: now + self.params.pull_repeat_period(),
                },
            );
            debug!(%txid, by, pull_list_size = list.len(), "added to the pull list");
        }
        if !self.env.pull_from_random_peer(&[txid]) {
            warn!(%txid, "no peer available for pull");
        }
    }

    pub fn stop_pulling(&self, txid: &TransactionId) {
        if self.pull_list.lock().remove(txid).is_some() {
            debug!(%txid, "stop pulling");
        }
    }

    pub fn is_pulling(&self, txid: &TransactionId) -> bool {
        self.pull_list.lock().contains_key(txid)
    }

    pub fn num_pending(&self) -> usize {
        self.pull_list.lock().len()
    }

    /// Ids whose deadline passed, with their deadlines reset. The flag says
    /// whether at least one of them has been wanted for longer than the
    /// escalation threshold.
    fn matured_pull_list(&self) -> (Vec<TransactionId>, bool) {
        let mut matured = Vec::new();
        let mut one_is_stuck = false;
        let now = Instant::now();
        let next_deadline = now + self.params.pull_repeat_period();
        let stuck_after = self.params.pull_stuck_after();

        let mut list = self.pull_list.lock();
        for (txid, record) in list.iter_mut() {
            if now < record.next_deadline {
                continue;
            }
            if now.duration_since(record.start) > stuck_after {
                one_is_stuck = true;
            }
            record.next_deadline = next_deadline;
            matured.push(*txid);
        }
        (matured, one_is_stuck)
    }

    /// Background retry loop; one task per client.
    pub fn start(self: &Arc<Self>, mut cancel: watch::Receiver<bool>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(client.params.pull_loop_period());
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
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
                let (matured, stuck) = client.matured_pull_list();
                if matured.is_empty() {
                    continue;
                }
                if stuck {
                    // some are long overdue: broadcast the whole batch
                    client.env.pull_from_all_peers(&matured);
                } else {
                    client.env.pull_from_random_peer(&matured);
                }
            }
            info!("pull client loop stopped");
        })
    }
}
