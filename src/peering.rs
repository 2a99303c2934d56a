//! Wire frames of the three peer streams (gossip, pull, heartbeat) and the
//! `Peers` seam the transport implements. The transport itself lives outside
//! this crate; everything here is pure codec plus the trait boundary.

use std::time::Duration;

use crate::errors::{TangleError, TangleResult};
use crate::types::{
    split_tx_bytes_with_metadata, TransactionId, TxMetadata, TRANSACTION_ID_LENGTH,
};

/// Peers are addressed opaquely; the transport owns the real identities.
pub type PeerId = u64;

/// Clock skew beyond this tolerance leads to a peer drop.
pub const CLOCK_TOLERANCE: Duration = Duration::from_secs(5);

const HEARTBEAT_LENGTH: usize = 8 + 1;

const FLAG_IGNORES_ALL_PULL_REQUESTS: u8 = 0b0000_0001;
const FLAG_ACCEPTS_PULLS_FROM_STATIC_PEERS_ONLY: u8 = 0b0000_0010;

/// Heartbeat payload: the sender's clock plus pull-policy flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatInfo {
    pub clock_unix_nanos: u64,
    pub ignores_all_pull_requests: bool,
    pub accepts_pulls_from_static_peers_only: bool,
}

impl HeartbeatInfo {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(HEARTBEAT_LENGTH);
        ret.extend_from_slice(&self.clock_unix_nanos.to_be_bytes());
        let mut flags = 0u8;
        if self.ignores_all_pull_requests {
            flags |= FLAG_IGNORES_ALL_PULL_REQUESTS;
        }
        if self.accepts_pulls_from_static_peers_only {
            flags |= FLAG_ACCEPTS_PULLS_FROM_STATIC_PEERS_ONLY;
        }
        ret.push(flags);
        ret
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        if data.len() != HEARTBEAT_LENGTH {
            return Err(TangleError::MalformedTx(format!(
                "heartbeat: wrong data length {}",
                data.len()
            )));
        }
        let clock_unix_nanos = u64::from_be_bytes(data[..8].try_into().expect("checked length"));
        let flags = data[8];
        Ok(Self {
            clock_unix_nanos,
            ignores_all_pull_requests: flags & FLAG_IGNORES_ALL_PULL_REQUESTS != 0,
            accepts_pulls_from_static_peers_only: flags
                & FLAG_ACCEPTS_PULLS_FROM_STATIC_PEERS_ONLY
                != 0,
        })
    }

    /// Whether the peer's clock is within tolerance of ours. The perceived
    /// difference includes the communication delay.
    pub fn clock_ok(&self, local_unix_nanos: u64) -> bool {
        let diff = self.clock_unix_nanos.abs_diff(local_unix_nanos);
        diff <= CLOCK_TOLERANCE.as_nanos() as u64
    }
}

/// Pull frame: `u16 count || count × txid`.
pub fn encode_pull_request(txids: &[TransactionId]) -> TangleResult<Vec<u8>> {
    if txids.len() > u16::MAX as usize {
        return Err(TangleError::MalformedTx(format!(
            "pull request with {} ids does not fit one frame",
            txids.len()
        )));
    }
    let mut ret = Vec::with_capacity(2 + txids.len() * TRANSACTION_ID_LENGTH);
    ret.extend_from_slice(&(txids.len() as u16).to_be_bytes());
    for txid in txids {
        ret.extend_from_slice(txid.as_bytes());
    }
    Ok(ret)
}

pub fn decode_pull_request(data: &[u8]) -> TangleResult<Vec<TransactionId>> {
    if data.len() < 2 {
        return Err(TangleError::MalformedTx("pull request too short".into()));
    }
    let count = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() != 2 + count * TRANSACTION_ID_LENGTH {
        return Err(TangleError::MalformedTx(format!(
            "pull request: wrong data length {} for {count} ids",
            data.len()
        )));
    }
    let mut ret = Vec::with_capacity(count);
    for chunk in data[2..].chunks_exact(TRANSACTION_ID_LENGTH) {
        ret.push(TransactionId::from_bytes(chunk)?);
    }
    Ok(ret)
}

/// Gossip frame: `metadata (length-prefixed) || tx bytes`.
pub fn encode_gossip(metadata: &TxMetadata, tx_bytes: &[u8]) -> Vec<u8> {
    metadata.join_with_tx_bytes(tx_bytes)
}

pub fn decode_gossip(data: &[u8]) -> TangleResult<(TxMetadata, &[u8])> {
    split_tx_bytes_with_metadata(data)
}

/// The transport boundary. Pull requests go to peers that announce a tx
/// store and are alive; gossip fans out to everyone except the source.
pub trait Peers: Send + Sync {
    /// Sends a pull request to one random eligible peer; false when none.
    fn pull_from_random_peer(&self, txids: &[TransactionId]) -> bool;
    fn pull_from_all_peers(&self, txids: &[TransactionId]);
    /// Gossips one `metadata || tx bytes` frame, skipping `except`.
    fn gossip_tx(&self, frame: &[u8], except: Option<PeerId>);
}

/// Stand-in for a node without a transport: pulls go nowhere and report so.
pub struct NoPeers;

impl Peers for NoPeers {
    fn pull_from_random_peer(&self, _txids: &[TransactionId]) -> bool {
        false
    }

    fn pull_from_all_peers(&self, _txids: &[TransactionId]) {}

    fn gossip_tx(&self, _frame: &[u8], _except: Option<PeerId>) {}
}
