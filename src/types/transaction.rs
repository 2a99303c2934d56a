use serde::{Deserialize, Serialize};

use crate::errors::{TangleError, TangleResult};
use crate::types::{ChainId, Lock, Output, OutputId, Slot, TransactionId, CHAIN_ID_LENGTH};

pub const MAX_INPUTS: usize = 255;
pub const MAX_OUTPUTS: usize = 255;
pub const MAX_ENDORSEMENTS: usize = 8;

/// Sentinel chain id carried by a chain-origin output. The effective chain id
/// is derived from the origin output id when the output is committed.
pub const CHAIN_ORIGIN: ChainId = ChainId([0u8; CHAIN_ID_LENGTH]);

/// The transaction body. The id is deterministic over the encoded body; slot
/// and the sequencer/branch flags are recoverable from the id alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub slot: Slot,
    /// Chain this sequencer transaction advances; `CHAIN_ORIGIN` when the
    /// transaction originates the chain. `None` for plain transfers.
    pub sequencer_id: Option<ChainId>,
    /// Stem output of the predecessor branch; present on every branch except
    /// the genesis emission.
    pub stem_input: Option<OutputId>,
    pub inputs: Vec<OutputId>,
    pub endorsements: Vec<TransactionId>,
    pub outputs: Vec<Output>,
    pub inflation: u64,
}

impl Transaction {
    pub fn is_sequencer(&self) -> bool {
        self.sequencer_id.is_some()
    }

    /// A branch is a state checkpoint: it produces the next stem output.
    pub fn is_branch(&self) -> bool {
        self.outputs.iter().any(|o| o.lock.is_stem())
    }

    /// The genesis emission: a branch with no past.
    pub fn is_genesis(&self) -> bool {
        self.is_branch() && self.stem_input.is_none() && self.inputs.is_empty()
    }

    pub fn id(&self) -> TransactionId {
        let body_hash = *blake3::hash(&self.to_bytes()).as_bytes();
        TransactionId::new(self.slot, self.is_sequencer(), self.is_branch(), &body_hash)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("transaction encoding is infallible")
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        let tx: Transaction = bincode::deserialize(data)
            .map_err(|err| TangleError::MalformedTx(format!("undecodable body: {err}")))?;
        tx.check_basic()?;
        Ok(tx)
    }

    /// Structural checks that need no input resolution. Performed at every
    /// ingress before a transaction enters the tangle.
    pub fn check_basic(&self) -> TangleResult<()> {
        if self.outputs.is_empty() {
            return Err(TangleError::MalformedTx("no outputs".into()));
        }
        if self.outputs.len() > MAX_OUTPUTS {
            return Err(TangleError::MalformedTx(format!(
                "too many outputs: {}",
                self.outputs.len()
            )));
        }
        if self.num_inputs() > MAX_INPUTS {
            return Err(TangleError::MalformedTx(format!(
                "too many inputs: {}",
                self.num_inputs()
            )));
        }
        if self.endorsements.len() > MAX_ENDORSEMENTS {
            return Err(TangleError::MalformedTx(format!(
                "too many endorsements: {}",
                self.endorsements.len()
            )));
        }
        if self.outputs.iter().filter(|o| o.lock.is_stem()).count() > 1 {
            return Err(TangleError::MalformedTx("more than one stem output".into()));
        }
        if self.is_branch() && !self.is_sequencer() {
            return Err(TangleError::MalformedTx(
                "branch must be a sequencer transaction".into(),
            ));
        }
        if !self.is_sequencer() && !self.endorsements.is_empty() {
            return Err(TangleError::MalformedTx(
                "only sequencer transactions endorse".into(),
            ));
        }
        if self.is_genesis() && self.inflation != 0 {
            return Err(TangleError::MalformedTx(
                "genesis emission carries no inflation".into(),
            ));
        }
        if self.stem_input.is_some() && !self.is_branch() {
            return Err(TangleError::MalformedTx(
                "stem input on a non-branch transaction".into(),
            ));
        }
        if self.is_branch() && self.stem_input.is_none() && !self.inputs.is_empty() {
            return Err(TangleError::MalformedTx(
                "non-genesis branch without a stem input".into(),
            ));
        }
        if self.inflation > 0 && !self.is_sequencer() {
            return Err(TangleError::MalformedTx(
                "inflation on a non-sequencer transaction".into(),
            ));
        }
        let mut seen_inputs = std::collections::HashSet::new();
        for oid in self.all_inputs() {
            if !seen_inputs.insert(oid) {
                return Err(TangleError::MalformedTx(format!(
                    "input {oid} consumed twice"
                )));
            }
        }
        for oid in self.all_inputs() {
            if oid.slot() > self.slot {
                return Err(TangleError::MalformedTx(format!(
                    "input {oid} is younger than the transaction slot"
                )));
            }
        }
        for endorsed in &self.endorsements {
            if !endorsed.is_sequencer() {
                return Err(TangleError::MalformedTx(format!(
                    "endorsement target {endorsed} is not a sequencer transaction"
                )));
            }
            if endorsed.slot() > self.slot {
                return Err(TangleError::MalformedTx(format!(
                    "endorsement target {endorsed} is younger than the transaction slot"
                )));
            }
        }
        Ok(())
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len() + usize::from(self.stem_input.is_some())
    }

    /// All consumed output ids in stable order; the stem input, when present,
    /// takes index 0.
    pub fn all_inputs(&self) -> impl Iterator<Item = OutputId> + '_ {
        self.stem_input
            .iter()
            .copied()
            .chain(self.inputs.iter().copied())
    }

    pub fn input_at(&self, index: usize) -> Option<OutputId> {
        self.all_inputs().nth(index)
    }

    pub fn produced_outputs(&self) -> impl Iterator<Item = (OutputId, &Output)> + '_ {
        let txid = self.id();
        self.outputs
            .iter()
            .enumerate()
            .map(move |(idx, out)| (txid.output_id(idx as u8), out))
    }

    /// Semantic validation against resolved inputs. Plays the role of the
    /// delegated script evaluator: the caller supplies a loader for consumed
    /// outputs, the validator checks conservation and continuity.
    pub fn validate<F>(&self, resolve: F) -> TangleResult<()>
    where
        F: Fn(&OutputId) -> Option<Output>,
    {
        self.check_basic()?;

        if self.is_genesis() {
            // emission from nothing, permitted only against an empty store;
            // the attacher enforces the store precondition
            return Ok(());
        }

        let mut consumed_total: u64 = 0;
        let mut resolved = Vec::with_capacity(self.num_inputs());
        for oid in self.all_inputs() {
            let out = resolve(&oid)
                .ok_or_else(|| TangleError::ConstraintFailure(format!("unresolved input {oid}")))?;
            consumed_total = consumed_total
                .checked_add(out.amount)
                .ok_or_else(|| TangleError::ArithmeticOverflow(format!("consumed amount at {oid}")))?;
            resolved.push((oid, out));
        }

        if let Some(stem_oid) = self.stem_input {
            let (_, stem_out) = resolved
                .iter()
                .find(|(oid, _)| *oid == stem_oid)
                .expect("stem input is resolved above");
            if !stem_out.lock.is_stem() {
                return Err(TangleError::ConstraintFailure(format!(
                    "stem input {stem_oid} is not a stem output"
                )));
            }
        }

        let produced_total = self
            .outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
            .ok_or_else(|| TangleError::ArithmeticOverflow("produced amount".into()))?;

        let available = consumed_total
            .checked_add(self.inflation)
            .ok_or_else(|| TangleError::ArithmeticOverflow("inflation".into()))?;
        if produced_total != available {
            return Err(TangleError::ConstraintFailure(format!(
                "amounts not conserved: consumed {consumed_total} + inflation {} != produced {produced_total}",
                self.inflation
            )));
        }

        if let Some(seq_id) = self.sequencer_id {
            if seq_id != CHAIN_ORIGIN {
                let continues = resolved.iter().any(|(oid, out)| match out.chain_id {
                    Some(chain) if chain == seq_id => true,
                    Some(chain) if chain == CHAIN_ORIGIN => ChainId::from_origin(oid) == seq_id,
                    _ => false,
                });
                if !continues {
                    return Err(TangleError::ConstraintFailure(format!(
                        "sequencer transaction does not consume the tip of chain {seq_id}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Where a transaction came from. Influences gossip (the source peer is
/// skipped) and pull bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxSource {
    Api,
    Peer,
    TxStore,
    Sequencer,
}

impl TxSource {
    fn to_byte(self) -> u8 {
        match self {
            TxSource::Api => 0,
            TxSource::Peer => 1,
            TxSource::TxStore => 2,
            TxSource::Sequencer => 3,
        }
    }

    fn from_byte(b: u8) -> TangleResult<Self> {
        Ok(match b {
            0 => TxSource::Api,
            1 => TxSource::Peer,
            2 => TxSource::TxStore,
            3 => TxSource::Sequencer,
            _ => return Err(TangleError::MalformedTx(format!("unknown tx source {b}"))),
        })
    }
}

/// Position of a gossip message within a multi-part reply to a pull request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortionInfo {
    pub index: u16,
    pub last_index: u16,
}

const METADATA_FLAG_PORTION: u8 = 0b0000_0001;
const METADATA_FLAG_SEQ_HINT: u8 = 0b0000_0010;

/// Transaction metadata travelling next to tx bytes, both on the wire and in
/// the tx-bytes store. Length-prefixed fixed schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMetadata {
    pub source: TxSource,
    pub portion: Option<PortionInfo>,
    pub sequencer_id_hint: Option<ChainId>,
}

impl Default for TxMetadata {
    fn default() -> Self {
        Self {
            source: TxSource::Api,
            portion: None,
            sequencer_id_hint: None,
        }
    }
}

impl TxMetadata {
    pub fn with_source(source: TxSource) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.portion.is_some() {
            flags |= METADATA_FLAG_PORTION;
        }
        if self.sequencer_id_hint.is_some() {
            flags |= METADATA_FLAG_SEQ_HINT;
        }
        let mut body = Vec::with_capacity(2 + 4 + CHAIN_ID_LENGTH);
        body.push(flags);
        body.push(self.source.to_byte());
        if let Some(portion) = self.portion {
            body.extend_from_slice(&portion.index.to_be_bytes());
            body.extend_from_slice(&portion.last_index.to_be_bytes());
        }
        if let Some(hint) = self.sequencer_id_hint {
            body.extend_from_slice(hint.as_bytes());
        }
        debug_assert!(body.len() <= u8::MAX as usize);
        let mut ret = Vec::with_capacity(1 + body.len());
        ret.push(body.len() as u8);
        ret.extend_from_slice(&body);
        ret
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        if data.len() < 2 {
            return Err(TangleError::MalformedTx("metadata too short".into()));
        }
        let flags = data[0];
        let mut cursor = 2usize;
        let source = TxSource::from_byte(data[1])?;
        let portion = if flags & METADATA_FLAG_PORTION != 0 {
            if data.len() < cursor + 4 {
                return Err(TangleError::MalformedTx("metadata portion truncated".into()));
            }
            let index = u16::from_be_bytes([data[cursor], data[cursor + 1]]);
            let last_index = u16::from_be_bytes([data[cursor + 2], data[cursor + 3]]);
            cursor += 4;
            Some(PortionInfo { index, last_index })
        } else {
            None
        };
        let sequencer_id_hint = if flags & METADATA_FLAG_SEQ_HINT != 0 {
            if data.len() < cursor + CHAIN_ID_LENGTH {
                return Err(TangleError::MalformedTx("metadata hint truncated".into()));
            }
            let hint = ChainId::from_bytes(&data[cursor..cursor + CHAIN_ID_LENGTH])?;
            cursor += CHAIN_ID_LENGTH;
            Some(hint)
        } else {
            None
        };
        if cursor != data.len() {
            return Err(TangleError::MalformedTx("metadata trailing bytes".into()));
        }
        Ok(Self {
            source,
            portion,
            sequencer_id_hint,
        })
    }

    /// `metadata || tx bytes` as stored and gossiped.
    pub fn join_with_tx_bytes(&self, tx_bytes: &[u8]) -> Vec<u8> {
        let mut ret = self.to_bytes();
        ret.extend_from_slice(tx_bytes);
        ret
    }
}

/// Splits a `metadata || tx bytes` blob back into its halves.
pub fn split_tx_bytes_with_metadata(data: &[u8]) -> TangleResult<(TxMetadata, &[u8])> {
    if data.is_empty() {
        return Err(TangleError::MalformedTx("empty tx blob".into()));
    }
    let metadata_len = data[0] as usize;
    if data.len() < 1 + metadata_len {
        return Err(TangleError::MalformedTx(
            "metadata length out of range".into(),
        ));
    }
    let metadata = if metadata_len == 0 {
        TxMetadata::default()
    } else {
        TxMetadata::from_bytes(&data[1..1 + metadata_len])?
    };
    Ok((metadata, &data[1 + metadata_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, Lock};

    fn account(n: u8) -> Lock {
        Lock::Account(AccountId::new(vec![n; 4]).unwrap())
    }

    fn genesis_tx(supply: u64) -> Transaction {
        Transaction {
            slot: Slot::ZERO,
            sequencer_id: Some(CHAIN_ORIGIN),
            stem_input: None,
            inputs: Vec::new(),
            endorsements: Vec::new(),
            outputs: vec![Output::new(supply, Lock::Stem).with_chain(CHAIN_ORIGIN)],
            inflation: 0,
        }
    }

    #[test]
    fn genesis_is_branch_and_sequencer() {
        let tx = genesis_tx(1_000);
        assert!(tx.is_genesis());
        assert!(tx.is_branch());
        assert!(tx.is_sequencer());
        let id = tx.id();
        assert!(id.is_branch());
        assert!(id.is_sequencer());
        assert_eq!(id.slot(), Slot::ZERO);
        tx.validate(|_| None).unwrap();
    }

    #[test]
    fn body_roundtrip_preserves_id() {
        let tx = genesis_tx(7);
        let back = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(back.id(), tx.id());
    }

    #[test]
    fn amounts_must_be_conserved() {
        let genesis = genesis_tx(1_000);
        let tip = genesis.id().output_id(0);
        let chain = ChainId::from_origin(&tip);
        let tx = Transaction {
            slot: Slot(1),
            sequencer_id: Some(chain),
            stem_input: None,
            inputs: vec![tip],
            endorsements: Vec::new(),
            outputs: vec![
                Output::new(400, account(1)).with_chain(chain),
                Output::new(500, account(2)),
            ],
            inflation: 0,
        };
        let resolve = |oid: &OutputId| {
            (*oid == tip).then(|| Output::new(1_000, Lock::Stem).with_chain(CHAIN_ORIGIN))
        };
        let err = tx.validate(resolve).unwrap_err();
        assert!(matches!(err, TangleError::ConstraintFailure(_)));

        let mut balanced = tx.clone();
        balanced.outputs[1].amount = 600;
        balanced.validate(resolve).unwrap();
    }

    #[test]
    fn sequencer_must_consume_its_chain_tip() {
        let genesis = genesis_tx(1_000);
        let tip = genesis.id().output_id(0);
        let other_chain = ChainId([9u8; CHAIN_ID_LENGTH]);
        let tx = Transaction {
            slot: Slot(1),
            sequencer_id: Some(other_chain),
            stem_input: None,
            inputs: vec![tip],
            endorsements: Vec::new(),
            outputs: vec![Output::new(1_000, account(1))],
            inflation: 0,
        };
        let resolve = |oid: &OutputId| {
            (*oid == tip).then(|| Output::new(1_000, Lock::Stem).with_chain(CHAIN_ORIGIN))
        };
        let err = tx.validate(resolve).unwrap_err();
        assert!(matches!(err, TangleError::ConstraintFailure(_)));
    }

    #[test]
    fn metadata_roundtrip() {
        let full = TxMetadata {
            source: TxSource::Peer,
            portion: Some(PortionInfo {
                index: 2,
                last_index: 9,
            }),
            sequencer_id_hint: Some(ChainId([3u8; CHAIN_ID_LENGTH])),
        };
        let blob = full.join_with_tx_bytes(b"txbytes");
        let (back, tx_bytes) = split_tx_bytes_with_metadata(&blob).unwrap();
        assert_eq!(back, full);
        assert_eq!(tx_bytes, b"txbytes");

        let minimal = TxMetadata::default();
        let blob = minimal.join_with_tx_bytes(b"x");
        let (back, rest) = split_tx_bytes_with_metadata(&blob).unwrap();
        assert_eq!(back, minimal);
        assert_eq!(rest, b"x");
    }
}
