//! The attacher state machine. A milestone attacher drives one received
//! transaction from undefined through past-cone solidification, baseline
//! selection, conflict checking and coverage computation to a terminal
//! status, committing the state when the target is a branch. The incremental
//! attacher reuses the same inner state to keep a transaction under
//! construction conflict-free.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::LedgerParams;
use crate::errors::{TangleError, TangleResult};
use crate::memdag::MemDag;
use crate::multistate::{
    fetch_all_root_records, fetch_root_record, Mutations, Readable, RootRecord, RootRecordParams,
    Updatable,
};
use crate::types::{Commitment, OutputId, Slot, Transaction, TransactionId};
use crate::vertex::{
    Flags, Status, WrappedOutput, WrappedTx, FLAG_CONSTRAINTS_VALID, FLAG_DEFINED,
    FLAG_ENDORSEMENTS_SOLID, FLAG_INPUTS_SOLID, FLAG_KNOWN,
};

/// Everything an attacher needs from the node, passed explicitly instead of
/// living in process globals.
pub trait AttacherEnvironment: Send + Sync + 'static {
    fn dag(&self) -> &MemDag;
    fn ledger_params(&self) -> &LedgerParams;
    /// Requests the transaction bytes from peers via the pull client.
    fn pull(&self, txid: TransactionId);
    /// Registers a single-shot wake-up on `with` for the waiting attacher.
    fn poke_me(&self, me: Arc<Notify>, with: &Arc<WrappedTx>);
    fn post_event_new_good(&self, vid: &Arc<WrappedTx>);
    fn post_event_new_transaction(&self, vid: &Arc<WrappedTx>);
}

/// The baseline a past cone is evaluated against. `branch` is `None` only
/// for the genesis emission, which runs against the empty state.
struct BaselineInfo {
    branch: Option<Arc<WrappedTx>>,
    record: Option<RootRecord>,
    reader: Arc<Readable>,
}

impl BaselineInfo {
    fn root(&self) -> Commitment {
        self.record
            .as_ref()
            .map(|r| r.root)
            .unwrap_or(Commitment::EMPTY)
    }

    fn slot(&self) -> Slot {
        self.branch.as_ref().map(|b| b.slot()).unwrap_or(Slot::ZERO)
    }

    fn coverage(&self) -> u64 {
        self.record.as_ref().map(|r| r.ledger_coverage).unwrap_or(0)
    }

    fn supply(&self) -> u64 {
        self.record.as_ref().map(|r| r.supply).unwrap_or(0)
    }
}

struct ConeEntry {
    vid: Arc<WrappedTx>,
    flags: Flags,
}

/// Shared inner state of the milestone and incremental attachers.
struct Attacher {
    name: String,
    env: Arc<dyn AttacherEnvironment>,
    poke: Arc<Notify>,
    baseline: Option<BaselineInfo>,
    /// The past cone under evaluation, target included.
    vertices: HashMap<TransactionId, ConeEntry>,
    /// Ancestors resolved against the baseline state: which of their output
    /// indices the cone consumes as roots.
    rooted: HashMap<TransactionId, BTreeSet<u8>>,
    /// Cone-wide consumption registry for double-spend detection.
    consumed: HashMap<OutputId, TransactionId>,
    /// Every vertex this attacher holds a reference on.
    referenced: HashMap<TransactionId, Arc<WrappedTx>>,
}

impl Attacher {
    fn new(name: String, env: Arc<dyn AttacherEnvironment>) -> Self {
        Self {
            name,
            env,
            poke: Arc::new(Notify::new()),
            baseline: None,
            vertices: HashMap::new(),
            rooted: HashMap::new(),
            consumed: HashMap::new(),
            referenced: HashMap::new(),
        }
    }

    fn reference(&mut self, vid: &Arc<WrappedTx>) -> bool {
        if self.referenced.contains_key(&vid.id()) {
            return true;
        }
        if !vid.try_reference() {
            return false;
        }
        self.referenced.insert(vid.id(), vid.clone());
        true
    }

    /// Releases every reference held. Called exactly once at the end of the
    /// attacher's life, whatever the outcome.
    fn close(&mut self) {
        for (_, vid) in self.referenced.drain() {
            vid.release();
        }
        self.vertices.clear();
    }

    fn add_cone_vertex(&mut self, vid: &Arc<WrappedTx>) -> bool {
        if self.vertices.contains_key(&vid.id()) {
            return true;
        }
        if !self.reference(vid) {
            return false;
        }
        let mut flags = Flags::default();
        flags.set(FLAG_KNOWN);
        self.vertices.insert(
            vid.id(),
            ConeEntry {
                vid: vid.clone(),
                flags,
            },
        );
        true
    }

    fn cone_flags(&self, txid: &TransactionId) -> Flags {
        self.vertices
            .get(txid)
            .map(|e| e.flags)
            .unwrap_or_default()
    }

    fn set_cone_flag(&mut self, txid: &TransactionId, fl: Flags) {
        if let Some(entry) = self.vertices.get_mut(txid) {
            entry.flags.set(fl);
        }
    }

    /// Looks the dependency up in the DAG, inserting a virtual vertex and
    /// issuing a pull when it is unknown. Always leaves a wake-up behind.
    fn ensure_dependency(&mut self, txid: TransactionId) -> Option<Arc<WrappedTx>> {
        if let Some(vid) = self.referenced.get(&txid) {
            let vid = vid.clone();
            self.env.poke_me(self.poke.clone(), &vid);
            return Some(vid);
        }
        let dag = self.env.dag();
        let mut created = false;
        let vid = match dag.get_vertex(&txid) {
            Some(vid) => vid,
            None => dag.with_global_write_lock(|access| {
                if let Some(vid) = access.get_vertex_no_lock(&txid) {
                    vid
                } else {
                    let vid = WrappedTx::new_virtual(txid);
                    access.add_vertex_no_lock(vid.clone());
                    created = true;
                    vid
                }
            }),
        };
        if created {
            trace!(attacher = %self.name, %txid, "unknown ancestor, pulling");
            self.env.pull(txid);
        }
        if !self.reference(&vid) {
            // the vertex is being reclaimed; the next pass recreates it
            return None;
        }
        self.env.poke_me(self.poke.clone(), &vid);
        Some(vid)
    }

    /// Registers a consumption in the cone-wide registry, failing on the
    /// second distinct consumer of the same output.
    fn register_consumption(
        &mut self,
        oid: OutputId,
        consumer: TransactionId,
    ) -> TangleResult<()> {
        match self.consumed.get(&oid) {
            None => {
                self.consumed.insert(oid, consumer);
                Ok(())
            }
            Some(existing) if *existing == consumer => Ok(()),
            Some(existing) => Err(TangleError::DoubleSpendInPastCone {
                output: oid,
                consumer1: *existing,
                consumer2: consumer,
            }),
        }
    }

    fn baseline(&self) -> &BaselineInfo {
        self.baseline.as_ref().expect("baseline is resolved")
    }

    /// Fixes the baseline for the target once its determinants are solid
    /// enough. Returns false while still undecidable.
    fn solidify_baseline(&mut self, target: &Arc<WrappedTx>) -> TangleResult<bool> {
        if self.baseline.is_some() {
            return Ok(true);
        }
        let Some(tx) = target.with_full(|data| data.tx.clone()) else {
            return Err(TangleError::MalformedTx(format!(
                "attached vertex {} has no transaction",
                target.id()
            )));
        };

        if tx.is_genesis() {
            if !self.env.dag().storage().has_no_committed_state()? {
                return Err(TangleError::ConstraintFailure(
                    "genesis emission on a non-empty store".into(),
                ));
            }
            let produced: u64 = tx.outputs.iter().map(|o| o.amount).sum();
            let expected = self.env.ledger_params().initial_supply;
            if produced != expected {
                return Err(TangleError::ConstraintFailure(format!(
                    "genesis emission of {produced} does not match the configured supply {expected}"
                )));
            }
            let reader = Arc::new(Readable::new(
                Arc::new(self.env.dag().storage().clone()),
                Commitment::EMPTY,
            ));
            self.baseline = Some(BaselineInfo {
                branch: None,
                record: None,
                reader,
            });
            return Ok(true);
        }

        if tx.is_branch() {
            let stem_input = tx.stem_input.ok_or_else(|| {
                TangleError::ConstraintFailure(format!(
                    "branch {} has no stem input",
                    target.id()
                ))
            })?;
            let predecessor = stem_input.transaction_id();
            if !predecessor.is_branch() {
                return Err(TangleError::ConstraintFailure(format!(
                    "stem input of {} does not come from a branch",
                    target.id()
                )));
            }
            return self.fix_baseline(target, predecessor, &tx);
        }

        match self.baseline_candidate(&tx)? {
            Some(candidate) => self.fix_baseline(target, candidate, &tx),
            None => Ok(false),
        }
    }

    /// Baseline of a non-branch transaction: the youngest branch among the
    /// dependency candidates. Ties break by greater coverage, then by
    /// lexicographically smaller branch id.
    fn baseline_candidate(&mut self, tx: &Transaction) -> TangleResult<Option<TransactionId>> {
        let mut candidates: BTreeSet<TransactionId> = BTreeSet::new();
        let mut unresolved: Vec<TransactionId> = Vec::new();

        for dep in dependency_ids(tx) {
            if dep.is_branch() {
                candidates.insert(dep);
                continue;
            }
            let vertex = self.env.dag().get_vertex(&dep);
            let baseline_of_dep = vertex
                .as_ref()
                .and_then(|v| v.with_full(|data| data.baseline.as_ref().map(|b| b.id())))
                .flatten();
            match baseline_of_dep {
                Some(branch) => {
                    candidates.insert(branch);
                }
                None => unresolved.push(dep),
            }
        }

        // a dependency without a local baseline may still be committed in a
        // known branch state; scan newest first
        if !unresolved.is_empty() {
            let mut records = fetch_all_root_records(self.env.dag().storage())?;
            records.sort_by(|(a, ra), (b, rb)| {
                b.slot()
                    .cmp(&a.slot())
                    .then_with(|| rb.ledger_coverage.cmp(&ra.ledger_coverage))
                    .then_with(|| a.cmp(b))
            });
            let storage = self.env.dag().storage().clone();
            unresolved.retain(|dep| {
                for (branch, record) in &records {
                    let reader = Readable::new(Arc::new(storage.clone()), record.root);
                    if reader.knows_committed_transaction(dep).unwrap_or(false) {
                        candidates.insert(*branch);
                        return false;
                    }
                }
                true
            });
        }

        if !unresolved.is_empty() {
            // wait for the missing determinants, making sure they are coming
            for dep in unresolved {
                self.ensure_dependency(dep);
            }
            return Ok(None);
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(TransactionId, u64)> = None;
        for candidate in &candidates {
            let Some(record) = fetch_root_record(self.env.dag().storage(), candidate)? else {
                // candidate branch not committed locally yet
                self.ensure_dependency(*candidate);
                return Ok(None);
            };
            let better = match &best {
                None => true,
                Some((chosen, chosen_coverage)) => {
                    match candidate.slot().cmp(&chosen.slot()) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => {
                            match record.ledger_coverage.cmp(chosen_coverage) {
                                std::cmp::Ordering::Greater => true,
                                std::cmp::Ordering::Less => false,
                                std::cmp::Ordering::Equal => candidate < chosen,
                            }
                        }
                    }
                }
            };
            if better {
                best = Some((*candidate, record.ledger_coverage));
            }
        }
        Ok(best.map(|(txid, _)| txid))
    }

    /// Binds the attacher to `branch` and verifies every other candidate is
    /// an ancestor of it.
    fn fix_baseline(
        &mut self,
        target: &Arc<WrappedTx>,
        branch: TransactionId,
        tx: &Transaction,
    ) -> TangleResult<bool> {
        let Some(record) = fetch_root_record(self.env.dag().storage(), &branch)? else {
            // the baseline branch exists but is not committed locally yet
            self.ensure_dependency(branch);
            return Ok(false);
        };
        let branch_vid = self.ensure_branch_vertex(branch);
        if !self.reference(&branch_vid) {
            return Ok(false);
        }
        let reader = Arc::new(Readable::new(
            Arc::new(self.env.dag().storage().clone()),
            record.root,
        ));

        // every other baseline determinant must lie in the chosen branch's
        // past, otherwise the past cone spans irreconcilable states
        for dep in dependency_ids(tx) {
            let other = if dep.is_branch() {
                Some(dep)
            } else {
                self.env
                    .dag()
                    .get_vertex(&dep)
                    .and_then(|v| v.with_full(|data| data.baseline.as_ref().map(|b| b.id())))
                    .flatten()
            };
            if let Some(other) = other {
                if other != branch && !reader.knows_committed_transaction(&other)? {
                    return Err(TangleError::ConflictingBaselines(format!(
                        "branch {other} of an ancestor is not in the past of baseline {branch}"
                    )));
                }
            }
        }

        trace!(attacher = %self.name, baseline = %branch, "baseline fixed");
        target.run_write(|data| data.baseline = Some(branch_vid.clone()));
        self.baseline = Some(BaselineInfo {
            branch: Some(branch_vid),
            record: Some(record),
            reader,
        });
        Ok(true)
    }

    /// A branch committed in the store may have no vertex yet, e.g. after a
    /// restart. It enters the DAG as a good virtual vertex.
    fn ensure_branch_vertex(&self, txid: TransactionId) -> Arc<WrappedTx> {
        let dag = self.env.dag();
        if let Some(vid) = dag.get_branch(&txid) {
            return vid;
        }
        dag.with_global_write_lock(|access| {
            if let Some(vid) = access.get_vertex_no_lock(&txid) {
                access.add_branch_no_lock(vid.clone());
                vid.set_status(Status::Good);
                vid
            } else {
                let vid = WrappedTx::new_virtual(txid);
                vid.set_status(Status::Good);
                access.add_branch_no_lock(vid.clone());
                vid
            }
        })
    }

    /// One solidification wave over the cone. Returns true when the whole
    /// cone, target included, is defined.
    fn run_pass(&mut self, target: &Arc<WrappedTx>) -> TangleResult<bool> {
        if !self.solidify_baseline(target)? {
            // without a baseline the only productive work is making sure the
            // determinants are on their way
            return Ok(false);
        }
        loop {
            let pending: Vec<Arc<WrappedTx>> = self
                .vertices
                .values()
                .filter(|e| !e.flags.up(FLAG_DEFINED))
                .map(|e| e.vid.clone())
                .collect();
            if pending.is_empty() {
                return Ok(true);
            }
            // cone growth counts as progress: freshly discovered ancestors
            // get their own wave before the attacher goes to sleep
            let before = (self.vertices.len(), self.defined_count());
            for vid in pending {
                self.solidify_vertex(&vid, target)?;
            }
            if (self.vertices.len(), self.defined_count()) == before {
                return Ok(false);
            }
        }
    }

    fn defined_count(&self) -> usize {
        self.vertices
            .values()
            .filter(|e| e.flags.up(FLAG_DEFINED))
            .count()
    }

    /// Tries to advance one cone vertex towards `Defined`. Returns whether
    /// anything changed.
    fn solidify_vertex(
        &mut self,
        vid: &Arc<WrappedTx>,
        target: &Arc<WrappedTx>,
    ) -> TangleResult<bool> {
        if self.cone_flags(&vid.id()).up(FLAG_DEFINED) {
            return Ok(false);
        }
        if vid.status() == Status::Bad {
            let err = vid
                .error()
                .map(|e| TangleError::ConstraintFailure(format!("ancestor {}: {e}", vid.id())))
                .unwrap_or_else(|| {
                    TangleError::ConstraintFailure(format!("ancestor {} is bad", vid.id()))
                });
            return Err(err);
        }
        let Some(tx) = vid.with_full(|data| data.tx.clone()) else {
            // virtual and not rooted: bytes are still on their way
            self.env.poke_me(self.poke.clone(), vid);
            return Ok(false);
        };

        let inputs_solid = self.solidify_inputs(vid, &tx)?;
        if inputs_solid {
            self.set_cone_flag(&vid.id(), FLAG_INPUTS_SOLID);
            vid.set_flag(FLAG_INPUTS_SOLID);
        }
        let endorsements_solid = self.solidify_endorsements(vid, &tx)?;
        if endorsements_solid {
            self.set_cone_flag(&vid.id(), FLAG_ENDORSEMENTS_SOLID);
            vid.set_flag(FLAG_ENDORSEMENTS_SOLID);
        }
        if !(inputs_solid && endorsements_solid) {
            return Ok(false);
        }

        if vid.status() != Status::Good {
            self.validate_constraints(vid, &tx)?;
            vid.set_flag(FLAG_CONSTRAINTS_VALID);
        }
        self.set_cone_flag(&vid.id(), FLAG_DEFINED);
        vid.set_flag(FLAG_DEFINED);

        if vid.id() != target.id() && vid.status() == Status::Undefined {
            // an ancestor whose own past cone just checked out is fit to
            // build on; its waiting dependents get their pokes now
            vid.set_status(Status::Good);
            self.env.post_event_new_good(vid);
            self.env.post_event_new_transaction(vid);
            vid.poke();
        }
        debug!(attacher = %self.name, vertex = %vid.id(), "defined");
        Ok(true)
    }

    fn solidify_inputs(&mut self, vid: &Arc<WrappedTx>, tx: &Transaction) -> TangleResult<bool> {
        let consumer = vid.id();
        let baseline_reader = self.baseline().reader.clone();
        let mut all_solid = true;
        for (slot_idx, oid) in tx.all_inputs().enumerate() {
            let producer_txid = oid.transaction_id();
            if self
                .rooted
                .get(&producer_txid)
                .is_some_and(|idxs| idxs.contains(&oid.index()))
            {
                continue;
            }
            if baseline_reader.knows_committed_transaction(&producer_txid)? {
                // rooted: the consumed output must still exist on the baseline
                if !baseline_reader.has_utxo(&oid)? {
                    return Err(TangleError::ConstraintFailure(format!(
                        "input {oid} of {consumer} is already spent in the baseline state"
                    )));
                }
                self.register_consumption(oid, consumer)?;
                self.rooted.entry(producer_txid).or_default().insert(oid.index());
                continue;
            }

            // the producer belongs to the cone
            let Some(producer) = self.ensure_dependency(producer_txid) else {
                all_solid = false;
                continue;
            };
            if producer.status() == Status::Bad {
                return Err(TangleError::ConstraintFailure(format!(
                    "input {oid} of {consumer} comes from a bad transaction"
                )));
            }
            self.register_consumption(oid, consumer)?;
            producer.register_consumer(oid.index(), consumer);
            vid.run_write(|data| {
                if data.inputs[slot_idx].is_none() {
                    data.inputs[slot_idx] = Some(producer.clone());
                }
            });
            if !self.add_cone_vertex(&producer) {
                all_solid = false;
                continue;
            }
            if !self.cone_flags(&producer_txid).up(FLAG_DEFINED) {
                all_solid = false;
            }
        }
        Ok(all_solid)
    }

    fn solidify_endorsements(
        &mut self,
        vid: &Arc<WrappedTx>,
        tx: &Transaction,
    ) -> TangleResult<bool> {
        let baseline_reader = self.baseline().reader.clone();
        let baseline_branch = self.baseline().branch.as_ref().map(|b| b.id());
        let mut all_solid = true;
        for (slot_idx, endorsed_txid) in tx.endorsements.iter().enumerate() {
            if baseline_reader.knows_committed_transaction(endorsed_txid)? {
                // endorsing a transaction the baseline already carries
                continue;
            }
            let Some(endorsed) = self.ensure_dependency(*endorsed_txid) else {
                all_solid = false;
                continue;
            };
            if endorsed.status() == Status::Bad {
                return Err(TangleError::ConstraintFailure(format!(
                    "endorsed transaction {endorsed_txid} is bad"
                )));
            }
            vid.run_write(|data| {
                if data.endorsements[slot_idx].is_none() {
                    data.endorsements[slot_idx] = Some(endorsed.clone());
                }
            });
            // endorsed baselines must agree with ours
            if let Some(endorsed_baseline) =
                endorsed.with_full(|data| data.baseline.as_ref().map(|b| b.id())).flatten()
            {
                if baseline_branch != Some(endorsed_baseline)
                    && !baseline_reader.knows_committed_transaction(&endorsed_baseline)?
                {
                    return Err(TangleError::ConflictingBaselines(format!(
                        "endorsed {endorsed_txid} settles on branch {endorsed_baseline}"
                    )));
                }
            }
            if !self.add_cone_vertex(&endorsed) {
                all_solid = false;
                continue;
            }
            if !self.cone_flags(endorsed_txid).up(FLAG_DEFINED) {
                all_solid = false;
            }
        }
        Ok(all_solid)
    }

    /// Runs the delegated constraint validation with inputs resolved from the
    /// baseline state or from cone producers.
    fn validate_constraints(&self, vid: &Arc<WrappedTx>, tx: &Transaction) -> TangleResult<()> {
        let baseline = self.baseline();
        let resolve = |oid: &OutputId| {
            let producer_txid = oid.transaction_id();
            if self
                .rooted
                .get(&producer_txid)
                .is_some_and(|idxs| idxs.contains(&oid.index()))
            {
                return baseline.reader.get_utxo(oid).ok().flatten();
            }
            self.vertices
                .get(&producer_txid)
                .and_then(|entry| entry.vid.output_at(oid.index()))
        };
        tx.validate(resolve).map_err(|err| {
            vid.set_error(TangleError::ConstraintFailure(err.to_string()));
            vid.set_status(Status::Bad);
            self.env.post_event_new_transaction(vid);
            vid.poke();
            err
        })
    }

    /// Deterministic ledger coverage of the solidified cone.
    fn ledger_coverage(&self, target: &Arc<WrappedTx>) -> u64 {
        let baseline = self.baseline();
        let params = self.env.ledger_params();
        let gap = target.slot().0.saturating_sub(baseline.slot().0);
        let aged = params.age_coverage(baseline.coverage(), gap);
        let inflation: u64 = self
            .vertices
            .values()
            .filter(|e| e.vid.is_sequencer())
            .filter_map(|e| e.vid.with_full(|data| data.tx.inflation))
            .sum();
        aged.saturating_add(inflation)
    }

    /// Inflation accumulated by the cone since the baseline, every new
    /// transaction counted.
    fn slot_inflation(&self) -> u64 {
        self.vertices
            .values()
            .filter_map(|e| e.vid.with_full(|data| data.tx.inflation))
            .sum()
    }

    /// Commits the branch state: consumed rooted outputs leave, surviving
    /// cone outputs enter, every cone transaction is recorded, and the root
    /// record lands in the same batch.
    fn finalize_branch(&mut self, target: &Arc<WrappedTx>, coverage: u64) -> TangleResult<()> {
        let tx = target
            .with_full(|data| data.tx.clone())
            .expect("branch target is a full vertex");
        let mut mutations = Mutations::new();

        for (producer, indices) in &self.rooted {
            for idx in indices {
                mutations.delete_output(producer.output_id(*idx));
            }
        }
        for entry in self.vertices.values() {
            let Some(cone_tx) = entry.vid.with_full(|data| data.tx.clone()) else {
                return Err(TangleError::MalformedTx(format!(
                    "cone vertex {} lost its transaction before commit",
                    entry.vid.id()
                )));
            };
            mutations.insert_committed_transaction(entry.vid.id(), cone_tx.slot);
            for (oid, output) in cone_tx.produced_outputs() {
                if !self.consumed.contains_key(&oid) {
                    mutations.insert_output(oid, output.clone());
                }
            }
        }

        let baseline = self.baseline();
        let slot_inflation = if tx.is_genesis() { 0 } else { self.slot_inflation() };
        let supply = if tx.is_genesis() {
            tx.outputs.iter().map(|o| o.amount).sum()
        } else {
            baseline.supply().saturating_add(slot_inflation)
        };
        let params = RootRecordParams {
            branch: target.id(),
            sequencer_id: tx.sequencer_id.expect("branch is a sequencer transaction"),
            ledger_coverage: coverage,
            slot_inflation,
            supply,
            num_transactions: self.vertices.len() as u32,
        };
        let mut updatable = Updatable::new(self.env.dag().storage().clone(), baseline.root());
        let root = updatable.apply(&mutations, Some(&params))?;

        self.env.dag().with_global_write_lock(|access| {
            access.add_branch_no_lock(target.clone());
        });
        debug!(
            attacher = %self.name,
            branch = %target.id(),
            %root,
            coverage,
            supply,
            "branch committed"
        );
        Ok(())
    }
}

fn dependency_ids(tx: &Transaction) -> impl Iterator<Item = TransactionId> + '_ {
    tx.all_inputs()
        .map(|oid| oid.transaction_id())
        .chain(tx.endorsements.iter().copied())
}

/// Options of a single milestone attachment.
pub struct AttachOptions {
    pub cancel: watch::Receiver<bool>,
    pub deadline: Option<Duration>,
    pub called_by: String,
}

/// Long-lived attacher driving one received transaction to a terminal
/// status. One pass per poke; between passes it sleeps on its notifier,
/// the cancellation signal and the optional deadline.
pub struct MilestoneAttacher {
    attacher: Attacher,
    vid: Arc<WrappedTx>,
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl MilestoneAttacher {
    pub fn new(vid: Arc<WrappedTx>, env: Arc<dyn AttacherEnvironment>, options: AttachOptions) -> Self {
        let name = format!("[attach {} by {}]", vid.id(), options.called_by);
        Self {
            attacher: Attacher::new(name, env),
            vid,
            cancel: options.cancel,
            deadline: options.deadline.map(|d| Instant::now() + d),
        }
    }

    /// Runs the attacher to completion. On success the vertex is `Good`; on
    /// a fatal fault it is `Bad` with the error frozen; cancellation and
    /// timeout leave the status untouched.
    pub async fn run(mut self) -> TangleResult<Status> {
        if self.vid.status().is_terminal() {
            return Ok(self.vid.status());
        }
        if !self.attacher.add_cone_vertex(&self.vid) {
            return Err(TangleError::NotFound(format!(
                "vertex {} is gone",
                self.vid.id()
            )));
        }
        loop {
            match self.attacher.run_pass(&self.vid) {
                Ok(true) => return self.finalize(),
                Ok(false) => {}
                Err(err) => return self.fail(err),
            }
            let poke = self.attacher.poke.clone();
            let deadline = self.deadline;
            tokio::select! {
                _ = poke.notified() => {}
                changed = self.cancel.changed() => {
                    let cancelled = changed.is_err() || *self.cancel.borrow();
                    if cancelled {
                        let id = self.vid.id();
                        return self.abort(TangleError::Cancelled(id));
                    }
                }
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let id = self.vid.id();
                    return self.abort(TangleError::Timeout(id));
                }
            }
        }
    }

    fn finalize(mut self) -> TangleResult<Status> {
        let coverage = self.attacher.ledger_coverage(&self.vid);
        if self.vid.is_branch() {
            let is_genesis = self
                .vid
                .with_full(|data| data.tx.is_genesis())
                .unwrap_or(false);
            let coverage = if is_genesis {
                self.vid
                    .with_full(|data| data.tx.outputs.iter().map(|o| o.amount).sum())
                    .unwrap_or(0)
            } else {
                coverage
            };
            if let Err(err) = self.attacher.finalize_branch(&self.vid, coverage) {
                // the commit did not happen: surfaced to the caller, the
                // vertex stays out of `Good`
                self.attacher.close();
                return Err(err);
            }
            self.vid.set_ledger_coverage(coverage);
        } else if self.vid.is_sequencer() {
            self.vid.set_ledger_coverage(coverage);
        }
        self.vid.set_status(Status::Good);
        if self.vid.is_sequencer() {
            self.attacher.env.post_event_new_good(&self.vid);
        }
        self.attacher.env.post_event_new_transaction(&self.vid);
        // status is visible before any dependent wakes up
        self.vid.poke();
        self.attacher.close();
        Ok(Status::Good)
    }

    fn fail(mut self, err: TangleError) -> TangleResult<Status> {
        debug!(vertex = %self.vid.id(), %err, "attachment failed");
        self.vid.set_error(err_clone_for_vertex(&err));
        self.vid.set_status(Status::Bad);
        self.attacher.env.post_event_new_transaction(&self.vid);
        self.vid.poke();
        self.attacher.close();
        Err(err)
    }

    /// Cancellation or timeout: references go, the status stays.
    fn abort(mut self, err: TangleError) -> TangleResult<Status> {
        self.attacher.close();
        if self.vid.external_references() == 0 {
            self.vid.set_error(err_clone_for_vertex(&err));
        }
        Err(err)
    }
}

fn err_clone_for_vertex(err: &TangleError) -> TangleError {
    match err {
        TangleError::DoubleSpendInPastCone {
            output,
            consumer1,
            consumer2,
        } => TangleError::DoubleSpendInPastCone {
            output: *output,
            consumer1: *consumer1,
            consumer2: *consumer2,
        },
        TangleError::MissingAncestor(txid) => TangleError::MissingAncestor(*txid),
        TangleError::Timeout(txid) => TangleError::Timeout(*txid),
        TangleError::Cancelled(txid) => TangleError::Cancelled(*txid),
        TangleError::ConflictingBaselines(msg) => TangleError::ConflictingBaselines(msg.clone()),
        other => TangleError::ConstraintFailure(other.to_string()),
    }
}

/// Short-lived attacher used while authoring a sequencer transaction: it
/// extends a chain tip, endorses other milestones and admits tag-along
/// inputs one by one, keeping the growing past cone conflict-free.
pub struct IncrementalAttacher {
    attacher: Attacher,
    target_slot: Slot,
    extend: WrappedOutput,
    endorse: Vec<Arc<WrappedTx>>,
    tag_along: Vec<WrappedOutput>,
}

impl IncrementalAttacher {
    pub fn new(
        name: String,
        env: Arc<dyn AttacherEnvironment>,
        target_slot: Slot,
        extend: WrappedOutput,
        endorse: Vec<Arc<WrappedTx>>,
    ) -> TangleResult<Self> {
        let mut attacher = Attacher::new(name, env);

        for endorsed in &endorse {
            if endorsed.status() != Status::Good {
                return Err(TangleError::ConstraintFailure(format!(
                    "cannot endorse {}: not good",
                    endorsed.id()
                )));
            }
        }
        if extend.vid.status() != Status::Good && !extend.vid.is_branch() {
            return Err(TangleError::ConstraintFailure(format!(
                "cannot extend {}: not good",
                extend.vid.id()
            )));
        }

        // candidates: the extended chain tip's branch and the endorsed
        // baselines; the youngest of them anchors the new milestone
        let mut candidate: Option<TransactionId> = None;
        let mut consider = |branch: TransactionId| match candidate {
            None => candidate = Some(branch),
            Some(current) if branch.slot() > current.slot() => candidate = Some(branch),
            _ => {}
        };
        for vid in endorse.iter().chain(std::iter::once(&extend.vid)) {
            if vid.is_branch() {
                consider(vid.id());
            } else if let Some(b) = vid
                .with_full(|data| data.baseline.as_ref().map(|b| b.id()))
                .flatten()
            {
                consider(b);
            }
        }
        let Some(branch) = candidate else {
            return Err(TangleError::ConstraintFailure(
                "no baseline determinant among the extended and endorsed milestones".into(),
            ));
        };
        let record = fetch_root_record(attacher.env.dag().storage(), &branch)?.ok_or_else(|| {
            TangleError::NotFound(format!("no root record for baseline branch {branch}"))
        })?;
        let branch_vid = attacher.ensure_branch_vertex(branch);
        attacher.reference(&branch_vid);
        let reader = Arc::new(Readable::new(
            Arc::new(attacher.env.dag().storage().clone()),
            record.root,
        ));
        attacher.baseline = Some(BaselineInfo {
            branch: Some(branch_vid),
            record: Some(record),
            reader,
        });

        let mut ret = Self {
            attacher,
            target_slot,
            extend,
            endorse,
            tag_along: Vec::new(),
        };
        for endorsed in ret.endorse.clone() {
            ret.absorb_good_cone(&endorsed)?;
        }
        let extend = ret.extend.clone();
        ret.absorb_good_cone(&extend.vid)?;
        ret.consume(&extend)?;
        Ok(ret)
    }

    /// Walks a good milestone's past cone down to the rooted boundary and
    /// registers its consumptions, so later tag-along inputs cannot conflict
    /// with it.
    fn absorb_good_cone(&mut self, vid: &Arc<WrappedTx>) -> TangleResult<()> {
        let attacher = &mut self.attacher;
        let mut err = None;
        let baseline_reader = attacher.baseline().reader.clone();
        let mut to_register: Vec<(Arc<WrappedTx>, Transaction)> = Vec::new();
        vid.traverse_past_cone_depth_first(|member| {
            if err.is_some() {
                return false;
            }
            match baseline_reader.knows_committed_transaction(&member.id()) {
                Ok(true) => false, // rooted boundary, do not descend
                Ok(false) => match member.with_full(|data| data.tx.clone()) {
                    Some(tx) => {
                        to_register.push((member.clone(), tx));
                        true
                    }
                    None => {
                        err = Some(TangleError::MissingAncestor(member.id()));
                        false
                    }
                },
                Err(e) => {
                    err = Some(e);
                    false
                }
            }
        });
        if let Some(err) = err {
            return Err(err);
        }
        for (member, tx) in to_register {
            if !attacher.add_cone_vertex(&member) {
                return Err(TangleError::NotFound(format!(
                    "cone member {} is gone",
                    member.id()
                )));
            }
            attacher.set_cone_flag(&member.id(), FLAG_DEFINED);
            for oid in tx.all_inputs() {
                let producer = oid.transaction_id();
                if baseline_reader.knows_committed_transaction(&producer)? {
                    if !baseline_reader.has_utxo(&oid)? {
                        return Err(TangleError::ConstraintFailure(format!(
                            "output {oid} consumed by {} is spent in the baseline",
                            member.id()
                        )));
                    }
                    attacher.rooted.entry(producer).or_default().insert(oid.index());
                }
                attacher.register_consumption(oid, member.id())?;
            }
        }
        Ok(())
    }

    /// Registers one consumption by the milestone under construction.
    fn consume(&mut self, wout: &WrappedOutput) -> TangleResult<()> {
        let oid = wout.output_id();
        let producer = oid.transaction_id();
        let baseline_reader = self.attacher.baseline().reader.clone();
        if baseline_reader.knows_committed_transaction(&producer)? {
            if !baseline_reader.has_utxo(&oid)? {
                return Err(TangleError::ConstraintFailure(format!(
                    "output {oid} is spent in the baseline state"
                )));
            }
            // check before mutate: a failed insertion must leave no trace
            if self.attacher.consumed.contains_key(&oid) {
                let existing = self.attacher.consumed[&oid];
                return Err(TangleError::DoubleSpendInPastCone {
                    output: oid,
                    consumer1: existing,
                    consumer2: milestone_placeholder_id(self.target_slot),
                });
            }
            self.attacher.rooted.entry(producer).or_default().insert(oid.index());
        } else {
            if wout.vid.status() != Status::Good {
                return Err(TangleError::ConstraintFailure(format!(
                    "tag-along source {} is not good",
                    wout.vid.id()
                )));
            }
            if self.attacher.consumed.contains_key(&oid) {
                let existing = self.attacher.consumed[&oid];
                return Err(TangleError::DoubleSpendInPastCone {
                    output: oid,
                    consumer1: existing,
                    consumer2: milestone_placeholder_id(self.target_slot),
                });
            }
            self.absorb_good_cone(&wout.vid.clone())?;
        }
        self.attacher
            .consumed
            .insert(oid, milestone_placeholder_id(self.target_slot));
        Ok(())
    }

    /// Admits one more tag-along input, or reports why it cannot join the
    /// cone. The attacher state is unchanged on rejection.
    pub fn insert_tag_along_input(&mut self, wout: WrappedOutput) -> TangleResult<()> {
        if self
            .tag_along
            .iter()
            .chain(std::iter::once(&self.extend))
            .any(|existing| existing.output_id() == wout.output_id())
        {
            return Err(TangleError::ConstraintFailure(format!(
                "output {} is already included",
                wout.output_id()
            )));
        }
        // consuming may absorb a whole new sub-cone; roll everything back
        // when the input is rejected midway
        let consumed_snapshot = self.attacher.consumed.clone();
        let rooted_snapshot = self.attacher.rooted.clone();
        let cone_snapshot: Vec<TransactionId> = self.attacher.vertices.keys().copied().collect();
        match self.consume(&wout) {
            Ok(()) => {
                self.tag_along.push(wout);
                Ok(())
            }
            Err(err) => {
                self.attacher.consumed = consumed_snapshot;
                self.attacher.rooted = rooted_snapshot;
                self.attacher
                    .vertices
                    .retain(|txid, _| cone_snapshot.contains(txid));
                Err(err)
            }
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.tag_along.len() + 1
    }

    pub fn inputs(&self) -> Vec<WrappedOutput> {
        let mut ret = vec![self.extend.clone()];
        ret.extend(self.tag_along.iter().cloned());
        ret
    }

    pub fn endorsements(&self) -> &[Arc<WrappedTx>] {
        &self.endorse
    }

    pub fn target_slot(&self) -> Slot {
        self.target_slot
    }

    /// Projected coverage of the milestone under construction.
    pub fn ledger_coverage(&self) -> u64 {
        let baseline = self.attacher.baseline();
        let params = self.attacher.env.ledger_params();
        let gap = self.target_slot.0.saturating_sub(baseline.slot().0);
        let aged = params.age_coverage(baseline.coverage(), gap);
        let inflation: u64 = self
            .attacher
            .vertices
            .values()
            .filter(|e| e.vid.is_sequencer())
            .filter_map(|e| e.vid.with_full(|data| data.tx.inflation))
            .sum();
        aged.saturating_add(inflation)
    }

    /// Releases every reference; the attacher is discarded after the
    /// transaction is built.
    pub fn close(mut self) {
        self.attacher.close();
    }
}

/// Placeholder consumer id for the milestone being built: its real id does
/// not exist until the transaction is signed and hashed.
fn milestone_placeholder_id(slot: Slot) -> TransactionId {
    TransactionId::new(slot, true, false, &[0xff; 32])
}
