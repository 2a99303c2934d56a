//! Multi-state layer: read and write committed branch states through the
//! persistent trie. Each branch owns a root record with the deterministic
//! values every node must compute identically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{TangleError, TangleResult};
use crate::storage::Storage;
use crate::trie::{NodeSource, TrieReader, TrieUpdatable};
use crate::types::{
    AccountId, ChainId, Commitment, Output, OutputId, OutputWithId, Slot, TransactionId,
    CHAIN_ORIGIN,
};

// partitions of the state trie
pub const PARTITION_LEDGER_STATE: u8 = 0x00;
pub const PARTITION_ACCOUNTS: u8 = 0x01;
pub const PARTITION_CHAIN_ID: u8 = 0x02;
pub const PARTITION_COMMITTED_TX: u8 = 0x03;

fn ledger_state_key(oid: &OutputId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + oid.as_bytes().len());
    key.push(PARTITION_LEDGER_STATE);
    key.extend_from_slice(oid.as_bytes());
    key
}

fn account_prefix(account: &AccountId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + account.as_bytes().len());
    key.push(PARTITION_ACCOUNTS);
    key.push(account.as_bytes().len() as u8);
    key.extend_from_slice(account.as_bytes());
    key
}

fn account_key(account: &AccountId, oid: &OutputId) -> Vec<u8> {
    let mut key = account_prefix(account);
    key.extend_from_slice(oid.as_bytes());
    key
}

fn chain_key(chain: &ChainId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + chain.as_bytes().len());
    key.push(PARTITION_CHAIN_ID);
    key.extend_from_slice(chain.as_bytes());
    key
}

fn committed_tx_key(txid: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + txid.as_bytes().len());
    key.push(PARTITION_COMMITTED_TX);
    key.extend_from_slice(txid.as_bytes());
    key
}

/// The chain id under which an output is indexed: origin outputs derive it
/// from their own id.
pub fn effective_chain_id(oid: &OutputId, declared: &ChainId) -> ChainId {
    if *declared == CHAIN_ORIGIN {
        ChainId::from_origin(oid)
    } else {
        *declared
    }
}

/// Deterministic values persisted with each committed branch state. All
/// honest nodes must produce bit-identical records for the same branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRecord {
    pub root: Commitment,
    pub sequencer_id: ChainId,
    pub ledger_coverage: u64,
    /// Total inflation since the previous branch, the branch itself included.
    pub slot_inflation: u64,
    /// `prev.supply + slot_inflation`.
    pub supply: u64,
    /// New transactions committed by this branch's slot.
    pub num_transactions: u32,
}

impl RootRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("root record encoding is infallible")
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[derive(Clone, Debug)]
pub struct RootRecordParams {
    pub branch: TransactionId,
    pub sequencer_id: ChainId,
    pub ledger_coverage: u64,
    pub slot_inflation: u64,
    pub supply: u64,
    pub num_transactions: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockedAccountInfo {
    pub balance: u64,
    pub num_outputs: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainRecordInfo {
    pub balance: u64,
    pub is_sequencer: bool,
    pub is_branch: bool,
}

pub fn fetch_root_record(
    storage: &Storage,
    branch: &TransactionId,
) -> TangleResult<Option<RootRecord>> {
    match storage.fetch_root_record_bytes(branch)? {
        Some(raw) => Ok(Some(RootRecord::from_bytes(&raw)?)),
        None => Ok(None),
    }
}

pub fn fetch_all_root_records(storage: &Storage) -> TangleResult<Vec<(TransactionId, RootRecord)>> {
    let mut ret = Vec::new();
    let mut decode_err = None;
    storage.iterate_root_records(|txid, raw| match RootRecord::from_bytes(raw) {
        Ok(record) => {
            ret.push((txid, record));
            true
        }
        Err(err) => {
            decode_err = Some(err);
            false
        }
    })?;
    match decode_err {
        Some(err) => Err(err),
        None => Ok(ret),
    }
}

/// Root records of branches within the `slot_span` slots up to and including
/// the latest committed slot, newest slot first within stable txid order.
pub fn fetch_root_records_n_slots_back(
    storage: &Storage,
    slot_span: u32,
) -> TangleResult<Vec<(TransactionId, RootRecord)>> {
    let Some(latest) = storage.latest_committed_slot()? else {
        return Ok(Vec::new());
    };
    let earliest = Slot(latest.0.saturating_sub(slot_span.saturating_sub(1)));
    let mut ret = fetch_all_root_records(storage)?;
    ret.retain(|(txid, _)| txid.slot() >= earliest && txid.slot() <= latest);
    ret.sort_by(|(a, _), (b, _)| b.slot().cmp(&a.slot()).then_with(|| a.cmp(b)));
    Ok(ret)
}

/// Thread-safe reader over the immutable trie rooted at one commitment. The
/// underlying trie reader mutates its node cache on every read, hence the
/// mutex.
#[derive(Debug)]
pub struct Readable {
    reader: Mutex<TrieReader>,
}

impl Readable {
    pub fn new(source: Arc<dyn NodeSource>, root: Commitment) -> Self {
        Self {
            reader: Mutex::new(TrieReader::new(source, root)),
        }
    }

    pub fn root(&self) -> Commitment {
        self.reader.lock().root()
    }

    pub fn get_utxo(&self, oid: &OutputId) -> TangleResult<Option<Output>> {
        let mut reader = self.reader.lock();
        match reader.get(&ledger_state_key(oid))? {
            Some(raw) => Ok(Some(Output::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn has_utxo(&self, oid: &OutputId) -> TangleResult<bool> {
        self.reader.lock().has(&ledger_state_key(oid))
    }

    pub fn knows_committed_transaction(&self, txid: &TransactionId) -> TangleResult<bool> {
        self.reader.lock().has(&committed_tx_key(txid))
    }

    pub fn ids_locked_in_account(&self, account: &AccountId) -> TangleResult<Vec<OutputId>> {
        let prefix = account_prefix(account);
        let entries = self.reader.lock().iter_prefix(&prefix)?;
        entries
            .iter()
            .map(|(key, _)| OutputId::from_bytes(&key[prefix.len()..]))
            .collect()
    }

    pub fn utxos_locked_in_account(&self, account: &AccountId) -> TangleResult<Vec<OutputWithId>> {
        let ids = self.ids_locked_in_account(account)?;
        let mut ret = Vec::with_capacity(ids.len());
        for id in ids {
            // index entries whose output vanished are skipped, not fatal
            if let Some(output) = self.get_utxo(&id)? {
                ret.push(OutputWithId { id, output });
            }
        }
        Ok(ret)
    }

    pub fn utxo_for_chain_id(&self, chain: &ChainId) -> TangleResult<Option<OutputWithId>> {
        let tip = self.reader.lock().get(&chain_key(chain))?;
        let Some(raw) = tip else {
            return Ok(None);
        };
        let id = OutputId::from_bytes(&raw)?;
        let output = self.get_utxo(&id)?.ok_or_else(|| {
            TangleError::ConstraintFailure(format!(
                "chain {chain} tip {id} missing from the ledger partition"
            ))
        })?;
        Ok(Some(OutputWithId { id, output }))
    }

    /// The unique stem output of this state. Exactly one must exist; a
    /// violation fails the read instead of panicking.
    pub fn stem(&self) -> TangleResult<(Slot, OutputWithId)> {
        let utxos = self.utxos_locked_in_account(&AccountId::stem())?;
        match utxos.as_slice() {
            [single] => Ok((single.id.slot(), single.clone())),
            [] => Err(TangleError::ConstraintFailure(
                "state has no stem output".into(),
            )),
            _ => Err(TangleError::ConstraintFailure(format!(
                "state has {} stem outputs, expected exactly 1",
                utxos.len()
            ))),
        }
    }

    /// Iterates committed transaction ids, optionally restricted to one slot.
    /// The callback returns false to stop.
    pub fn iterate_committed_transactions<F>(
        &self,
        mut f: F,
        slot: Option<Slot>,
    ) -> TangleResult<()>
    where
        F: FnMut(&TransactionId, Slot) -> bool,
    {
        let mut prefix = vec![PARTITION_COMMITTED_TX];
        if let Some(slot) = slot {
            prefix.extend_from_slice(&slot.to_bytes());
        }
        let entries = self.reader.lock().iter_prefix(&prefix)?;
        for (key, value) in entries {
            let txid = TransactionId::from_bytes(&key[1..])?;
            let slot = Slot::from_bytes(&value)?;
            if !f(&txid, slot) {
                break;
            }
        }
        Ok(())
    }

    /// Balance and output count per lock, over the whole ledger partition.
    pub fn accounts_by_locks(&self) -> TangleResult<HashMap<String, LockedAccountInfo>> {
        let entries = self.reader.lock().iter_prefix(&[PARTITION_LEDGER_STATE])?;
        let mut ret: HashMap<String, LockedAccountInfo> = HashMap::new();
        for (_, raw) in entries {
            let output = Output::from_bytes(&raw)?;
            let info = ret.entry(output.lock.to_display_string()).or_default();
            info.balance = info.balance.saturating_add(output.amount);
            info.num_outputs += 1;
        }
        Ok(ret)
    }

    pub fn chain_info(&self) -> TangleResult<HashMap<ChainId, ChainRecordInfo>> {
        let entries = self.reader.lock().iter_prefix(&[PARTITION_CHAIN_ID])?;
        let mut ret = HashMap::new();
        for (key, raw) in entries {
            let chain = ChainId::from_bytes(&key[1..])?;
            let tip_id = OutputId::from_bytes(&raw)?;
            let tip = self.get_utxo(&tip_id)?.ok_or_else(|| {
                TangleError::ConstraintFailure(format!(
                    "chain {chain} tip {tip_id} missing from the ledger partition"
                ))
            })?;
            let txid = tip_id.transaction_id();
            ret.insert(
                chain,
                ChainRecordInfo {
                    balance: tip.amount,
                    is_sequencer: txid.is_sequencer(),
                    is_branch: txid.is_branch(),
                },
            );
        }
        Ok(ret)
    }
}

/// Batch of state mutations produced by a branch attachment. Backed by
/// ordered maps so application order, and with it the resulting root, is
/// deterministic.
#[derive(Clone, Debug, Default)]
pub struct Mutations {
    add_outputs: BTreeMap<OutputId, Output>,
    remove_outputs: BTreeSet<OutputId>,
    add_committed: BTreeMap<TransactionId, Slot>,
}

impl Mutations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_output(&mut self, oid: OutputId, output: Output) {
        self.add_outputs.insert(oid, output);
    }

    pub fn delete_output(&mut self, oid: OutputId) {
        self.remove_outputs.insert(oid);
    }

    pub fn insert_committed_transaction(&mut self, txid: TransactionId, slot: Slot) {
        self.add_committed.insert(txid, slot);
    }

    pub fn num_created_outputs(&self) -> usize {
        self.add_outputs.len()
    }

    pub fn num_deleted_outputs(&self) -> usize {
        self.remove_outputs.len()
    }

    pub fn num_transactions(&self) -> usize {
        self.add_committed.len()
    }
}

/// Updatable ledger state bound to a root. Single writer; chained updates
/// rebind to each new root. The whole update lands in one storage batch.
pub struct Updatable {
    storage: Storage,
    root: Commitment,
}

impl Updatable {
    pub fn new(storage: Storage, root: Commitment) -> Self {
        Self { storage, root }
    }

    pub fn root(&self) -> Commitment {
        self.root
    }

    pub fn readable(&self) -> Readable {
        Readable::new(Arc::new(self.storage.clone()), self.root)
    }

    /// Applies the mutations and commits the trie delta, the root record and
    /// the latest-slot marker inside one atomic batch. Returns the new root
    /// and rebinds to it.
    pub fn apply(
        &mut self,
        mutations: &Mutations,
        params: Option<&RootRecordParams>,
    ) -> TangleResult<Commitment> {
        let source: Arc<dyn NodeSource> = Arc::new(self.storage.clone());
        let pre_state = Readable::new(source.clone(), self.root);
        let mut trie = TrieUpdatable::new(source, self.root);

        // removals first: consumed outputs leave the ledger and their index
        // entries go with them
        for oid in &mutations.remove_outputs {
            let output = pre_state.get_utxo(oid)?.ok_or_else(|| {
                TangleError::ConstraintFailure(format!(
                    "deleted output {oid} not found in the state"
                ))
            })?;
            trie.remove(&ledger_state_key(oid))?;
            trie.remove(&account_key(&output.lock.account_id(), oid))?;
            if let Some(declared) = &output.chain_id {
                let chain = effective_chain_id(oid, declared);
                // drop the chain-tip pointer only while it points here; a
                // successor added below overwrites it anyway
                let tip = pre_state.utxo_for_chain_id(&chain)?;
                if tip.map_or(false, |tip| tip.id == *oid) {
                    trie.remove(&chain_key(&chain))?;
                }
            }
        }

        for (oid, output) in &mutations.add_outputs {
            trie.insert(&ledger_state_key(oid), output.to_bytes())?;
            trie.insert(&account_key(&output.lock.account_id(), oid), Vec::new())?;
            if let Some(declared) = &output.chain_id {
                let chain = effective_chain_id(oid, declared);
                trie.insert(&chain_key(&chain), oid.as_bytes().to_vec())?;
            }
        }

        for (txid, slot) in &mutations.add_committed {
            trie.insert(&committed_tx_key(txid), slot.to_bytes().to_vec())?;
        }

        let new_root = trie.root();
        let mut batch = self.storage.state_batch();
        for (commitment, encoded) in trie.take_new_nodes() {
            batch.put_trie_node(&commitment, &encoded)?;
        }
        if let Some(params) = params {
            let record = RootRecord {
                root: new_root,
                sequencer_id: params.sequencer_id,
                ledger_coverage: params.ledger_coverage,
                slot_inflation: params.slot_inflation,
                supply: params.supply,
                num_transactions: params.num_transactions,
            };
            batch.put_root_record(&params.branch, &record.to_bytes())?;
            let branch_slot = params.branch.slot();
            if self.storage.latest_committed_slot()?.map_or(true, |latest| latest < branch_slot) {
                batch.put_latest_slot(branch_slot)?;
            }
        }
        batch.commit()?;

        self.root = new_root;
        Ok(new_root)
    }
}
