//! Wrapped-transaction identity objects, the vertices of the in-memory
//! tangle. A [`WrappedTx`] is the one stable handle for a transaction id;
//! behind it sits a full vertex, a virtual stand-in known only by id, or a
//! tombstone left by the pruner.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::errors::TangleError;
use crate::types::{Output, Slot, Transaction, TransactionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Undefined,
    Good,
    Bad,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Undefined)
    }
}

/// Monotone per-vertex flags: each bit only ever flips from 0 to 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u8);

pub const FLAG_KNOWN: Flags = Flags(0b0000_0001);
pub const FLAG_DEFINED: Flags = Flags(0b0000_0010);
pub const FLAG_INPUTS_SOLID: Flags = Flags(0b0000_0100);
pub const FLAG_ENDORSEMENTS_SOLID: Flags = Flags(0b0000_1000);
pub const FLAG_CONSTRAINTS_VALID: Flags = Flags(0b0001_0000);
pub const FLAG_TX_BYTES_PERSISTED: Flags = Flags(0b0010_0000);

impl Flags {
    pub fn up(&self, fl: Flags) -> bool {
        self.0 & fl.0 == fl.0
    }

    pub fn set(&mut self, fl: Flags) {
        self.0 |= fl.0;
    }
}

/// Full vertex: the decoded transaction plus one dependency slot per input
/// and endorsement. A `None` slot is not yet linked.
pub struct VertexData {
    pub tx: Transaction,
    pub inputs: Vec<Option<Arc<WrappedTx>>>,
    pub endorsements: Vec<Option<Arc<WrappedTx>>>,
    pub baseline: Option<Arc<WrappedTx>>,
}

impl VertexData {
    pub fn new(tx: Transaction) -> Self {
        let num_inputs = tx.num_inputs();
        let num_endorsements = tx.endorsements.len();
        Self {
            tx,
            inputs: vec![None; num_inputs],
            endorsements: vec![None; num_endorsements],
            baseline: None,
        }
    }

    pub fn for_each_input_dependency<F>(&self, mut f: F)
    where
        F: FnMut(u8, Option<&Arc<WrappedTx>>),
    {
        for (idx, dep) in self.inputs.iter().enumerate() {
            f(idx as u8, dep.as_ref());
        }
    }

    pub fn for_each_endorsement<F>(&self, mut f: F)
    where
        F: FnMut(u8, Option<&Arc<WrappedTx>>),
    {
        for (idx, dep) in self.endorsements.iter().enumerate() {
            f(idx as u8, dep.as_ref());
        }
    }
}

/// Virtual vertex: an ancestor known by id only, possibly with a few outputs
/// resolved from a committed state rather than from the tangle.
#[derive(Default)]
pub struct VirtualTx {
    pub outputs: HashMap<u8, Output>,
}

/// An output addressed through its producer vertex.
#[derive(Clone)]
pub struct WrappedOutput {
    pub vid: Arc<WrappedTx>,
    pub index: u8,
}

impl WrappedOutput {
    pub fn output_id(&self) -> crate::types::OutputId {
        self.vid.id().output_id(self.index)
    }

    pub fn output(&self) -> Option<Output> {
        self.vid.output_at(self.index)
    }
}

enum Variant {
    Full(VertexData),
    Virtual(VirtualTx),
    Deleted,
}

struct Inner {
    variant: Variant,
    status: Status,
    flags: Flags,
    err: Option<Arc<TangleError>>,
    coverage: Option<u64>,
}

/// The in-memory identity of a transaction. Everything except `id` sits
/// behind the per-vertex lock; the reference counter is atomic.
pub struct WrappedTx {
    id: TransactionId,
    inner: RwLock<Inner>,
    references: AtomicU32,
    unreferenced_since: Mutex<Option<Instant>>,
    /// Weak back-references: which transactions consume which output index.
    consumers: Mutex<HashMap<u8, HashSet<TransactionId>>>,
    /// Single-shot wake-up slots, drained on every poke.
    poke_list: Mutex<Vec<Arc<Notify>>>,
}

impl WrappedTx {
    fn new(id: TransactionId, variant: Variant) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: RwLock::new(Inner {
                variant,
                status: Status::Undefined,
                flags: Flags::default(),
                err: None,
                coverage: None,
            }),
            // creation hands over the single reference held by the MemDAG
            // map; until someone else references it, the vertex already
            // counts as a pruning candidate
            references: AtomicU32::new(1),
            unreferenced_since: Mutex::new(Some(Instant::now())),
            consumers: Mutex::new(HashMap::new()),
            poke_list: Mutex::new(Vec::new()),
        })
    }

    pub fn new_full(tx: Transaction) -> Arc<Self> {
        let id = tx.id();
        let vid = Self::new(id, Variant::Full(VertexData::new(tx)));
        vid.inner.write().flags.set(FLAG_KNOWN);
        vid
    }

    pub fn new_virtual(id: TransactionId) -> Arc<Self> {
        Self::new(id, Variant::Virtual(VirtualTx::default()))
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn slot(&self) -> Slot {
        self.id.slot()
    }

    pub fn is_sequencer(&self) -> bool {
        self.id.is_sequencer()
    }

    pub fn is_branch(&self) -> bool {
        self.id.is_branch()
    }

    /// Runs exactly one callback for the current variant, under the read
    /// lock.
    pub fn unwrap<R>(
        &self,
        on_full: impl FnOnce(&VertexData) -> R,
        on_virtual: impl FnOnce(&VirtualTx) -> R,
        on_deleted: impl FnOnce() -> R,
    ) -> R {
        let inner = self.inner.read();
        match &inner.variant {
            Variant::Full(data) => on_full(data),
            Variant::Virtual(v) => on_virtual(v),
            Variant::Deleted => on_deleted(),
        }
    }

    pub fn with_full<R>(&self, f: impl FnOnce(&VertexData) -> R) -> Option<R> {
        self.unwrap(|data| Some(f(data)), |_| None, || None)
    }

    /// Mutates the full vertex under the write lock; no-op on other variants.
    pub fn run_write<R>(&self, f: impl FnOnce(&mut VertexData) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        match &mut inner.variant {
            Variant::Full(data) => Some(f(data)),
            _ => None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.unwrap(|_| true, |_| false, || false)
    }

    pub fn is_virtual(&self) -> bool {
        self.unwrap(|_| false, |_| true, || false)
    }

    pub fn is_deleted(&self) -> bool {
        self.unwrap(|_| false, |_| false, || true)
    }

    /// Upgrades a virtual vertex once its transaction bytes arrived. Returns
    /// false when the vertex already is full or deleted.
    pub fn convert_to_full(&self, tx: Transaction) -> bool {
        debug_assert_eq!(tx.id(), self.id, "transaction does not match vertex id");
        let mut inner = self.inner.write();
        match inner.variant {
            Variant::Virtual(_) => {
                inner.variant = Variant::Full(VertexData::new(tx));
                inner.flags.set(FLAG_KNOWN);
                true
            }
            _ => false,
        }
    }

    /// Records an output resolved from a committed state on a virtual vertex.
    pub fn add_virtual_output(&self, index: u8, output: Output) {
        let mut inner = self.inner.write();
        if let Variant::Virtual(v) = &mut inner.variant {
            v.outputs.entry(index).or_insert(output);
        }
    }

    /// The output this transaction produced at `index`, as far as locally
    /// known.
    pub fn output_at(&self, index: u8) -> Option<Output> {
        self.unwrap(
            |data| data.tx.outputs.get(index as usize).cloned(),
            |v| v.outputs.get(&index).cloned(),
            || None,
        )
    }

    pub fn status(&self) -> Status {
        self.inner.read().status
    }

    /// Final transition out of `Undefined`. Once `Bad`, the status and the
    /// frozen error never change.
    pub fn set_status(&self, status: Status) {
        let mut inner = self.inner.write();
        if inner.status == Status::Undefined && status != Status::Undefined {
            inner.status = status;
        } else {
            debug_assert_eq!(
                inner.status, status,
                "status transition {:?} -> {:?} on {}",
                inner.status, status, self.id
            );
        }
    }

    pub fn set_error(&self, err: TangleError) {
        let mut inner = self.inner.write();
        if inner.err.is_none() {
            inner.err = Some(Arc::new(err));
        }
    }

    pub fn error(&self) -> Option<Arc<TangleError>> {
        self.inner.read().err.clone()
    }

    pub fn flags_up(&self, fl: Flags) -> bool {
        self.inner.read().flags.up(fl)
    }

    pub fn set_flag(&self, fl: Flags) {
        self.inner.write().flags.set(fl);
    }

    pub fn get_ledger_coverage(&self) -> Option<u64> {
        self.inner.read().coverage
    }

    /// Set at most once, for sequencer transactions only.
    pub fn set_ledger_coverage(&self, coverage: u64) {
        let mut inner = self.inner.write();
        debug_assert!(
            inner.coverage.is_none() || inner.coverage == Some(coverage),
            "ledger coverage set twice on {}",
            self.id
        );
        inner.coverage.get_or_insert(coverage);
    }

    /// Bumps the reference counter unless the vertex was already tombstoned
    /// (counter at zero); a dead vertex cannot be revived.
    pub fn try_reference(&self) -> bool {
        let mut current = self.references.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.references.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if current == 1 {
                        *self.unreferenced_since.lock() = None;
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops one reference. Down to the map's own single reference the vertex
    /// becomes a pruning candidate; the tombstone itself is installed by the
    /// pruner sweep.
    pub fn release(&self) -> u32 {
        let remaining = self.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 1 {
            *self.unreferenced_since.lock() = Some(Instant::now());
        }
        remaining
    }

    pub fn references(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    /// External references beyond the MemDAG map's own one.
    pub fn external_references(&self) -> u32 {
        self.references().saturating_sub(1)
    }

    /// Installs the tombstone when nothing but the map referenced the vertex
    /// for longer than `grace`. Returns whether it was deleted now.
    pub fn do_pruning_if_relevant(&self, now: Instant, grace: Duration) -> bool {
        let expired = self
            .unreferenced_since
            .lock()
            .map_or(false, |since| now.duration_since(since) >= grace);
        if !expired {
            return false;
        }
        let mut inner = self.inner.write();
        // by the time the counter sits at the map's single reference, no live
        // attacher holds this vertex; the CAS makes the decision final
        if self
            .references
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        inner.variant = Variant::Deleted;
        self.consumers.lock().clear();
        true
    }

    /// Registers `consumer` as spending output `index` of this vertex and
    /// returns the consumers recorded so far, the new one included.
    pub fn register_consumer(&self, index: u8, consumer: TransactionId) -> HashSet<TransactionId> {
        let mut consumers = self.consumers.lock();
        let entry = consumers.entry(index).or_default();
        entry.insert(consumer);
        entry.clone()
    }

    pub fn consumers_of(&self, index: u8) -> HashSet<TransactionId> {
        self.consumers
            .lock()
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    /// Installs a single-shot wake-up slot, delivered by the next poke.
    pub fn on_poke(&self, notify: Arc<Notify>) {
        self.poke_list.lock().push(notify);
    }

    /// Delivers one event to every registered waiter and clears the slots.
    pub fn poke(&self) {
        let waiters = std::mem::take(&mut *self.poke_list.lock());
        for notify in waiters {
            notify.notify_one();
        }
    }

    /// Iterative depth-first walk over the past cone, following input and
    /// endorsement edges. The visitor returns false to skip the vertex's
    /// ancestors. Cycle-free because the tangle is a DAG of ids.
    pub fn traverse_past_cone_depth_first<F>(self: &Arc<Self>, mut visit: F)
    where
        F: FnMut(&Arc<WrappedTx>) -> bool,
    {
        let mut visited: HashSet<TransactionId> = HashSet::new();
        let mut stack: Vec<Arc<WrappedTx>> = vec![self.clone()];
        while let Some(vid) = stack.pop() {
            if !visited.insert(vid.id()) {
                continue;
            }
            if !visit(&vid) {
                continue;
            }
            vid.with_full(|data| {
                for dep in data.inputs.iter().chain(data.endorsements.iter()) {
                    if let Some(dep) = dep {
                        if !visited.contains(&dep.id()) {
                            stack.push(dep.clone());
                        }
                    }
                }
            });
        }
    }
}

impl std::fmt::Debug for WrappedTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedTx")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("references", &self.references())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Lock, Output, Slot, Transaction, CHAIN_ORIGIN};

    fn simple_tx() -> Transaction {
        Transaction {
            slot: Slot::ZERO,
            sequencer_id: Some(CHAIN_ORIGIN),
            stem_input: None,
            inputs: Vec::new(),
            endorsements: Vec::new(),
            outputs: vec![Output::new(10, Lock::Stem).with_chain(CHAIN_ORIGIN)],
            inflation: 0,
        }
    }

    #[test]
    fn unwrap_selects_one_variant() {
        let full = WrappedTx::new_full(simple_tx());
        assert!(full.is_full());
        assert_eq!(full.unwrap(|_| "full", |_| "virtual", || "deleted"), "full");

        let virt = WrappedTx::new_virtual(simple_tx().id());
        assert!(virt.is_virtual());
        assert_eq!(virt.output_at(0), None);
        virt.add_virtual_output(0, Output::new(10, Lock::Stem));
        assert_eq!(virt.output_at(0).map(|o| o.amount), Some(10));
    }

    #[test]
    fn status_transitions_are_final() {
        let vid = WrappedTx::new_full(simple_tx());
        assert_eq!(vid.status(), Status::Undefined);
        vid.set_status(Status::Good);
        assert_eq!(vid.status(), Status::Good);
        // terminal; further identical sets are no-ops
        vid.set_status(Status::Good);
        assert_eq!(vid.status(), Status::Good);
    }

    #[test]
    fn flags_are_monotone() {
        let vid = WrappedTx::new_full(simple_tx());
        assert!(vid.flags_up(FLAG_KNOWN));
        assert!(!vid.flags_up(FLAG_DEFINED));
        vid.set_flag(FLAG_DEFINED);
        vid.set_flag(FLAG_INPUTS_SOLID);
        assert!(vid.flags_up(FLAG_DEFINED));
        assert!(vid.flags_up(FLAG_INPUTS_SOLID));
        assert!(vid.flags_up(Flags(FLAG_DEFINED.0 | FLAG_INPUTS_SOLID.0)));
    }

    #[test]
    fn references_cannot_revive_a_dead_vertex() {
        let vid = WrappedTx::new_full(simple_tx());
        // creation leaves the map's own single reference
        assert_eq!(vid.references(), 1);
        assert_eq!(vid.external_references(), 0);
        assert!(vid.try_reference());
        assert_eq!(vid.external_references(), 1);
        assert_eq!(vid.release(), 1);

        let grace = Duration::from_millis(0);
        assert!(vid.do_pruning_if_relevant(Instant::now(), grace));
        assert_eq!(vid.references(), 0);
        assert!(!vid.try_reference());
    }

    #[test]
    fn pruning_waits_for_the_grace_period() {
        let vid = WrappedTx::new_full(simple_tx());
        assert!(vid.try_reference());
        vid.release();
        let grace = Duration::from_secs(3600);
        assert!(!vid.do_pruning_if_relevant(Instant::now(), grace));
        assert!(!vid.is_deleted());
        assert!(vid.do_pruning_if_relevant(Instant::now() + grace, grace));
        assert!(vid.is_deleted());
        // gone: only the id survives
        assert_eq!(vid.output_at(0), None);
        assert!(vid.run_write(|_| ()).is_none());
    }

    #[test]
    fn re_referencing_clears_the_prune_stamp() {
        let vid = WrappedTx::new_full(simple_tx());
        assert!(vid.try_reference());
        vid.release();
        // a new reference arrives before the sweep: candidate no more
        assert!(vid.try_reference());
        let grace = Duration::from_millis(0);
        assert!(!vid.do_pruning_if_relevant(Instant::now(), grace));
        assert!(!vid.is_deleted());
    }

    #[test]
    fn consumer_registration_reports_conflicts() {
        let producer = WrappedTx::new_full(simple_tx());
        let a = TransactionId([1u8; 32]);
        let b = TransactionId([2u8; 32]);
        assert_eq!(producer.register_consumer(0, a).len(), 1);
        let both = producer.register_consumer(0, b);
        assert_eq!(both.len(), 2);
        assert!(both.contains(&a) && both.contains(&b));
        assert_eq!(producer.consumers_of(1).len(), 0);
    }

    #[tokio::test]
    async fn poke_wakes_registered_waiters_once() {
        let vid = WrappedTx::new_full(simple_tx());
        let notify = Arc::new(Notify::new());
        vid.on_poke(notify.clone());
        vid.poke();
        notify.notified().await;
        // slots are single-shot: a second poke without re-registration
        // delivers nothing
        vid.poke();
        assert!(tokio::time::timeout(Duration::from_millis(20), notify.notified())
            .await
            .is_err());
    }

    #[test]
    fn traverse_visits_linked_ancestors_once() {
        let grand = WrappedTx::new_full(simple_tx());
        let mut mid_tx = simple_tx();
        mid_tx.inputs = vec![grand.id().output_id(0)];
        mid_tx.outputs = vec![Output::new(10, Lock::Stem).with_chain(CHAIN_ORIGIN)];
        mid_tx.stem_input = None;
        let mid = WrappedTx::new_full(mid_tx);
        mid.run_write(|data| data.inputs[0] = Some(grand.clone()));

        let mut seen = Vec::new();
        mid.traverse_past_cone_depth_first(|vid| {
            seen.push(vid.id());
            true
        });
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&grand.id()));
        assert!(seen.contains(&mid.id()));
    }
}
