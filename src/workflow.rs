//! Workflow glue: the bounded transaction input queue with deduplication,
//! vertex creation and attacher dispatch, event fan-out, gossip, the poke
//! plumbing between attachers, and the inclusion-score query.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::attacher::{AttachOptions, AttacherEnvironment, MilestoneAttacher};
use crate::config::LedgerParams;
use crate::errors::{TangleError, TangleResult};
use crate::memdag::MemDag;
use crate::multistate::{fetch_root_records_n_slots_back, Readable, RootRecord};
use crate::peering::{encode_gossip, PeerId, Peers};
use crate::pull_client::{PullClient, PullClientEnvironment};
use crate::types::{
    split_tx_bytes_with_metadata, Slot, Transaction, TransactionId, TxMetadata, TxSource,
};
use crate::vertex::{Status, WrappedTx, FLAG_TX_BYTES_PERSISTED};

/// Fan-out events observers subscribe to. Every terminal attachment fires
/// `NewTransaction`; good sequencer milestones additionally fire `NewGoodTx`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    NewGoodTx(TransactionId),
    NewTransaction {
        txid: TransactionId,
        status: Status,
    },
}

struct QueuedTx {
    tx: Transaction,
    tx_bytes: Vec<u8>,
    metadata: TxMetadata,
    source_peer: Option<PeerId>,
}

/// Sliding-window deduplication of incoming transaction ids.
struct DedupWindow {
    seen: HashSet<TransactionId>,
    order: VecDeque<TransactionId>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// True when the id was not seen within the window.
    fn insert(&mut self, txid: TransactionId) -> bool {
        if !self.seen.insert(txid) {
            return false;
        }
        self.order.push_back(txid);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

pub struct Workflow {
    dag: Arc<MemDag>,
    params: LedgerParams,
    peers: Arc<dyn Peers>,
    pull_client: OnceLock<Arc<PullClient>>,
    input_tx: mpsc::Sender<QueuedTx>,
    input_rx: Mutex<Option<mpsc::Receiver<QueuedTx>>>,
    events: broadcast::Sender<Event>,
    dedup: Mutex<DedupWindow>,
    active_attachers: Mutex<HashSet<TransactionId>>,
    cancel: watch::Receiver<bool>,
}

impl Workflow {
    pub fn new(
        dag: Arc<MemDag>,
        params: LedgerParams,
        peers: Arc<dyn Peers>,
        input_queue_capacity: usize,
        dedup_window: usize,
        cancel: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (input_tx, input_rx) = mpsc::channel(input_queue_capacity.max(1));
        let (events, _) = broadcast::channel(1024);
        let workflow = Arc::new(Self {
            dag,
            params: params.clone(),
            peers,
            pull_client: OnceLock::new(),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            events,
            dedup: Mutex::new(DedupWindow::new(dedup_window)),
            active_attachers: Mutex::new(HashSet::new()),
            cancel,
        });
        let pull_client = PullClient::new(
            workflow.clone() as Arc<dyn PullClientEnvironment>,
            params,
        );
        workflow
            .pull_client
            .set(pull_client)
            .unwrap_or_else(|_| unreachable!("pull client is set once"));
        workflow
    }

    pub fn dag(&self) -> &MemDag {
        &self.dag
    }

    pub fn pull_client(&self) -> &Arc<PullClient> {
        self.pull_client.get().expect("pull client is wired at construction")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Transaction ingress shared by the API, the gossip handler and the
    /// tx-store re-injection. Parses and enqueues; heavy work happens on the
    /// workflow task.
    pub fn tx_bytes_in(
        &self,
        tx_bytes: Vec<u8>,
        metadata: TxMetadata,
        source_peer: Option<PeerId>,
    ) -> TangleResult<TransactionId> {
        let tx = Transaction::from_bytes(&tx_bytes)?;
        let txid = tx.id();
        if !self.dedup.lock().insert(txid) {
            trace!(%txid, "duplicate within the dedup window");
            return Ok(txid);
        }
        self.input_tx
            .try_send(QueuedTx {
                tx,
                tx_bytes,
                metadata,
                source_peer,
            })
            .map_err(|err| {
                warn!(%txid, "input queue overflow, transaction dropped: {err}");
                TangleError::QueueOverflow
            })?;
        Ok(txid)
    }

    /// Forwards a pull request for a missing transaction.
    pub fn pull(&self, txid: TransactionId) {
        self.pull_client().pull(txid, "api");
    }

    /// Runs the input consumer; one task per workflow.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let workflow = self.clone();
        let mut input_rx = self
            .input_rx
            .lock()
            .take()
            .expect("workflow started once");
        let mut cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    queued = input_rx.recv() => {
                        match queued {
                            Some(queued) => workflow.process_input(queued),
                            None => break,
                        }
                    }
                }
            }
            info!("workflow input loop stopped");
        })
    }

    fn process_input(self: &Arc<Self>, queued: QueuedTx) {
        let QueuedTx {
            tx,
            tx_bytes,
            metadata,
            source_peer,
        } = queued;
        let txid = tx.id();
        debug!(%txid, source = ?metadata.source, "transaction in");

        // bytes and metadata land in the tx-bytes store first, so pulls from
        // peers can be answered and restarts find them again
        let blob = metadata.join_with_tx_bytes(&tx_bytes);
        if let Err(err) = self.dag.storage().store_tx_bytes_with_metadata(&txid, &blob) {
            warn!(%txid, %err, "cannot persist tx bytes, dropping");
            return;
        }

        let vid = self.dag.with_global_write_lock(|access| {
            if let Some(existing) = access.get_vertex_no_lock(&txid) {
                existing
            } else {
                let vid = WrappedTx::new_full(tx.clone());
                access.add_vertex_no_lock(vid.clone());
                vid
            }
        });
        // an ancestor previously known only by id now has its transaction
        let converted = vid.convert_to_full(tx);
        vid.set_flag(FLAG_TX_BYTES_PERSISTED);
        self.pull_client().stop_pulling(&txid);
        if converted {
            // wake the attachers waiting for these bytes
            vid.poke();
        }

        self.dispatch_attacher(&vid);

        // everyone but the source hears about it
        if metadata.source != TxSource::TxStore {
            let gossip_metadata = TxMetadata {
                source: TxSource::Peer,
                ..metadata
            };
            let frame = encode_gossip(&gossip_metadata, &tx_bytes);
            self.peers.gossip_tx(&frame, source_peer);
        }
    }

    /// Spawns a milestone attacher unless one is already driving this vertex.
    fn dispatch_attacher(self: &Arc<Self>, vid: &Arc<WrappedTx>) {
        if vid.status().is_terminal() {
            return;
        }
        {
            let mut active = self.active_attachers.lock();
            if !active.insert(vid.id()) {
                return;
            }
        }
        let workflow = self.clone();
        let vid = vid.clone();
        tokio::spawn(async move {
            let options = AttachOptions {
                cancel: workflow.cancel.clone(),
                deadline: None,
                called_by: "workflow".into(),
            };
            let attacher = MilestoneAttacher::new(
                vid.clone(),
                workflow.clone() as Arc<dyn AttacherEnvironment>,
                options,
            );
            let result = attacher.run().await;
            workflow.active_attachers.lock().remove(&vid.id());
            match result {
                Ok(status) => debug!(txid = %vid.id(), ?status, "attachment finished"),
                Err(err) => debug!(txid = %vid.id(), %err, "attachment terminated"),
            }
        });
    }

    /// Waits until the transaction reaches a terminal status, dispatching an
    /// attacher when none is active. The deadline bounds the wait.
    pub async fn wait_attached(
        self: &Arc<Self>,
        txid: TransactionId,
        deadline: Option<Duration>,
    ) -> TangleResult<Status> {
        let mut events = self.events.subscribe();
        if let Some(vid) = self.dag.get_vertex(&txid) {
            if vid.status().is_terminal() {
                return Ok(vid.status());
            }
            self.dispatch_attacher(&vid);
        } else {
            self.pull_client().pull(txid, "wait");
        }
        let wait = async {
            loop {
                if let Some(vid) = self.dag.get_vertex(&txid) {
                    if vid.status().is_terminal() {
                        return vid.status();
                    }
                }
                // lagging behind the broadcast only forces another poll
                let _ = events.recv().await;
            }
        };
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, wait)
                .await
                .map_err(|_| TangleError::Timeout(txid)),
            None => Ok(wait.await),
        }
    }

    /// Inclusion of `txid` in the branches of the last `slot_span` slots:
    /// weak score counts branches, strong score weighs them by coverage. The
    /// threshold is echoed for callers deciding on finality.
    pub fn query_tx_inclusion_score(
        &self,
        txid: &TransactionId,
        threshold_numerator: u64,
        threshold_denominator: u64,
        slot_span: u32,
    ) -> TangleResult<InclusionScore> {
        if threshold_denominator == 0 || threshold_numerator > threshold_denominator {
            return Err(TangleError::Config(format!(
                "invalid inclusion threshold {threshold_numerator}/{threshold_denominator}"
            )));
        }
        let storage = self.dag.storage();
        let records = fetch_root_records_n_slots_back(storage, slot_span)?;
        let mut inclusion = Vec::with_capacity(records.len());
        let mut included_count = 0usize;
        let mut coverage_total: u128 = 0;
        let mut coverage_included: u128 = 0;
        let mut earliest_slot = None;
        let mut latest_slot = Slot::ZERO;

        for (branch, record) in records {
            let reader = Readable::new(Arc::new(storage.clone()), record.root);
            let included = reader.knows_committed_transaction(txid)?;
            let slot = branch.slot();
            earliest_slot = Some(earliest_slot.map_or(slot, |e: Slot| e.min(slot)));
            latest_slot = latest_slot.max(slot);
            coverage_total += u128::from(record.ledger_coverage);
            if included {
                included_count += 1;
                coverage_included += u128::from(record.ledger_coverage);
            }
            inclusion.push(TxInclusion {
                branch,
                record,
                included,
            });
        }

        let weak_score = if inclusion.is_empty() {
            0
        } else {
            (included_count * 100 / inclusion.len()) as u8
        };
        let strong_score = if coverage_total == 0 {
            0
        } else {
            (coverage_included * 100 / coverage_total) as u8
        };
        Ok(InclusionScore {
            weak_score,
            strong_score,
            earliest_slot: earliest_slot.unwrap_or(Slot::ZERO),
            latest_slot,
            threshold_numerator,
            threshold_denominator,
            inclusion,
        })
    }
}

/// Per-branch inclusion evidence for one queried transaction.
#[derive(Clone, Debug)]
pub struct TxInclusion {
    pub branch: TransactionId,
    pub record: RootRecord,
    pub included: bool,
}

#[derive(Clone, Debug)]
pub struct InclusionScore {
    pub weak_score: u8,
    pub strong_score: u8,
    pub earliest_slot: Slot,
    pub latest_slot: Slot,
    pub threshold_numerator: u64,
    pub threshold_denominator: u64,
    pub inclusion: Vec<TxInclusion>,
}

impl AttacherEnvironment for Workflow {
    fn dag(&self) -> &MemDag {
        &self.dag
    }

    fn ledger_params(&self) -> &LedgerParams {
        &self.params
    }

    fn pull(&self, txid: TransactionId) {
        self.pull_client().pull(txid, "attacher");
    }

    fn poke_me(&self, me: Arc<Notify>, with: &Arc<WrappedTx>) {
        with.on_poke(me);
    }

    fn post_event_new_good(&self, vid: &Arc<WrappedTx>) {
        let _ = self.events.send(Event::NewGoodTx(vid.id()));
    }

    fn post_event_new_transaction(&self, vid: &Arc<WrappedTx>) {
        let _ = self.events.send(Event::NewTransaction {
            txid: vid.id(),
            status: vid.status(),
        });
    }
}

impl PullClientEnvironment for Workflow {
    fn stored_tx_bytes(&self, txid: &TransactionId) -> Option<Vec<u8>> {
        self.dag
            .storage()
            .get_tx_bytes_with_metadata(txid)
            .ok()
            .flatten()
    }

    fn reinject_from_store(&self, blob: Vec<u8>) {
        let parsed = split_tx_bytes_with_metadata(&blob);
        match parsed {
            Ok((metadata, tx_bytes)) => {
                let metadata = TxMetadata {
                    source: TxSource::TxStore,
                    ..metadata
                };
                if let Err(err) = self.tx_bytes_in(tx_bytes.to_vec(), metadata, None) {
                    warn!(%err, "tx-store re-injection failed");
                }
            }
            Err(err) => warn!(%err, "undecodable blob in the tx-bytes store"),
        }
    }

    fn pull_from_random_peer(&self, txids: &[TransactionId]) -> bool {
        self.peers.pull_from_random_peer(txids)
    }

    fn pull_from_all_peers(&self, txids: &[TransactionId]) {
        self.peers.pull_from_all_peers(txids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_window_slides() {
        let mut window = DedupWindow::new(2);
        let a = TransactionId([1u8; 32]);
        let b = TransactionId([2u8; 32]);
        let c = TransactionId([3u8; 32]);
        assert!(window.insert(a));
        assert!(!window.insert(a));
        assert!(window.insert(b));
        // capacity 2: inserting c evicts a
        assert!(window.insert(c));
        assert!(window.insert(a));
        assert!(!window.insert(c));
    }
}
