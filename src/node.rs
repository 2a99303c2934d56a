use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::NodeConfig;
use crate::errors::{TangleError, TangleResult};
use crate::memdag::MemDag;
use crate::multistate::{fetch_root_record, Readable};
use crate::peering::{NoPeers, PeerId, Peers};
use crate::pruner::Pruner;
use crate::storage::Storage;
use crate::types::{TransactionId, TxMetadata, TxSource};
use crate::vertex::Status;
use crate::workflow::{Event, InclusionScore, Workflow};

/// The attachment core wired together: storage, MemDAG, workflow, pull
/// client and pruner. Upper layers (RPC, sequencer, transport) talk to it
/// through a [`NodeHandle`].
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    storage: Storage,
    dag: Arc<MemDag>,
    workflow: Arc<Workflow>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig) -> TangleResult<Self> {
        Self::with_peers(config, Arc::new(NoPeers))
    }

    pub fn with_peers(config: NodeConfig, peers: Arc<dyn Peers>) -> TangleResult<Self> {
        config.ensure_directories()?;
        let db_path = config.data_dir.join("db");
        let storage = Storage::open(&db_path)?;
        let dag = Arc::new(MemDag::new(
            storage.clone(),
            config.state_reader_cache_capacity,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workflow = Workflow::new(
            dag.clone(),
            config.ledger.clone(),
            peers,
            config.input_queue_capacity,
            config.dedup_window,
            shutdown_rx,
        );
        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                storage,
                dag,
                workflow,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Starts the work processes: workflow input loop, pull client retry
    /// loop and the pruner. Requires a running tokio runtime.
    pub fn start(&self) {
        let inner = &self.inner;
        info!(
            data_dir = %inner.config.data_dir.display(),
            latest_slot = ?inner.storage.latest_committed_slot().ok().flatten(),
            "starting attachment core"
        );
        let mut tasks = inner.tasks.lock();
        tasks.push(inner.workflow.start());
        tasks.push(
            inner
                .workflow
                .pull_client()
                .start(inner.shutdown.subscribe()),
        );
        let pruner = Pruner::new(inner.dag.clone(), inner.config.ledger.clone());
        tasks.push(pruner.start(inner.shutdown.subscribe()));
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    /// Signals every work process and attacher to stop.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

impl NodeHandle {
    /// Transaction ingress from the API surface.
    pub fn tx_bytes_in(&self, tx_bytes: Vec<u8>) -> TangleResult<TransactionId> {
        self.inner
            .workflow
            .tx_bytes_in(tx_bytes, TxMetadata::with_source(TxSource::Api), None)
    }

    /// Transaction ingress from the gossip layer.
    pub fn tx_bytes_in_from_peer(
        &self,
        tx_bytes: Vec<u8>,
        metadata: TxMetadata,
        from: PeerId,
    ) -> TangleResult<TransactionId> {
        self.inner.workflow.tx_bytes_in(tx_bytes, metadata, Some(from))
    }

    pub fn pull(&self, txid: TransactionId) {
        self.inner.workflow.pull(txid);
    }

    /// Whether the pull client is currently asking peers for `txid`.
    pub fn is_pulling(&self, txid: &TransactionId) -> bool {
        self.inner.workflow.pull_client().is_pulling(txid)
    }

    /// Drives the transaction to a terminal status and reports it.
    pub async fn attach(
        &self,
        txid: TransactionId,
        deadline: Option<Duration>,
    ) -> TangleResult<Status> {
        self.inner.workflow.wait_attached(txid, deadline).await
    }

    pub fn query_tx_inclusion_score(
        &self,
        txid: &TransactionId,
        threshold_numerator: u64,
        threshold_denominator: u64,
        slot_span: u32,
    ) -> TangleResult<InclusionScore> {
        self.inner.workflow.query_tx_inclusion_score(
            txid,
            threshold_numerator,
            threshold_denominator,
            slot_span,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.workflow.subscribe()
    }

    pub fn dag(&self) -> &Arc<MemDag> {
        &self.inner.dag
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Reader over the committed state of `branch`.
    pub fn readable(&self, branch: &TransactionId) -> TangleResult<Readable> {
        let record = fetch_root_record(&self.inner.storage, branch)?
            .ok_or_else(|| TangleError::NotFound(format!("no root record for branch {branch}")))?;
        Ok(Readable::new(
            Arc::new(self.inner.storage.clone()),
            record.root,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn test_node() -> (tempfile::TempDir, Node) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..NodeConfig::default()
        };
        let node = Node::new(config).unwrap();
        (dir, node)
    }

    #[tokio::test]
    async fn malformed_bytes_are_rejected_at_ingress() {
        let (_dir, node) = test_node();
        node.start();
        let err = node.handle().tx_bytes_in(b"garbage".to_vec()).unwrap_err();
        assert!(matches!(err, TangleError::MalformedTx(_)));
        node.shutdown();
    }

    #[tokio::test]
    async fn unknown_transaction_query_reports_not_found() {
        let (_dir, node) = test_node();
        let err = node
            .handle()
            .readable(&TransactionId([9u8; 32]))
            .unwrap_err();
        assert!(matches!(err, TangleError::NotFound(_)));
    }
}
