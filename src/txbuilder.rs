//! Authoring helpers for the transaction kinds the node deals with: the
//! genesis emission, plain sequencer steps and branch checkpoints. Used by
//! the sequencer program above this crate and throughout the tests.

use crate::errors::{TangleError, TangleResult};
use crate::types::{
    AccountId, ChainId, Lock, Output, OutputWithId, Slot, Transaction, TransactionId, CHAIN_ORIGIN,
};

/// The genesis emission: slot zero, no past, a zero-amount stem output and
/// the chain-origin output carrying the whole supply, locked under the
/// chain controller's account.
pub fn genesis_transaction(supply: u64, controller: AccountId) -> Transaction {
    Transaction {
        slot: Slot::ZERO,
        sequencer_id: Some(CHAIN_ORIGIN),
        stem_input: None,
        inputs: Vec::new(),
        endorsements: Vec::new(),
        outputs: vec![
            Output::new(0, Lock::Stem),
            Output::new(supply, Lock::Account(controller)).with_chain(CHAIN_ORIGIN),
        ],
        inflation: 0,
    }
}

/// The chain id originated by a genesis transaction.
pub fn genesis_chain_id(genesis: &Transaction) -> ChainId {
    ChainId::from_origin(&genesis.id().output_id(1))
}

/// The stem output id produced by a branch transaction.
pub fn produced_stem_output(tx: &Transaction) -> Option<crate::types::OutputId> {
    tx.produced_outputs()
        .find(|(_, out)| out.lock.is_stem())
        .map(|(oid, _)| oid)
}

pub struct SequencerTxParams {
    pub slot: Slot,
    /// The chain this milestone advances.
    pub chain_id: ChainId,
    /// Current chain tip being consumed.
    pub chain_input: OutputWithId,
    /// Previous stem output; present iff the milestone is a branch.
    pub stem_input: Option<OutputWithId>,
    /// Tag-along inputs, unlockable by the chain controller.
    pub additional_inputs: Vec<OutputWithId>,
    /// Extra outputs, e.g. payouts; whatever value remains stays on the
    /// chain tip.
    pub additional_outputs: Vec<Output>,
    pub endorsements: Vec<TransactionId>,
    pub inflation: u64,
}

/// Builds a sequencer milestone. The new chain tip collects every input
/// amount plus inflation, minus the declared extra outputs.
pub fn make_sequencer_transaction(params: SequencerTxParams) -> TangleResult<Transaction> {
    let SequencerTxParams {
        slot,
        chain_id,
        chain_input,
        stem_input,
        additional_inputs,
        additional_outputs,
        endorsements,
        inflation,
    } = params;

    let mut consumed_total = chain_input.output.amount;
    for extra in &additional_inputs {
        consumed_total = consumed_total
            .checked_add(extra.output.amount)
            .ok_or_else(|| TangleError::ArithmeticOverflow("consumed amounts".into()))?;
    }
    let paid_out: u64 = additional_outputs
        .iter()
        .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
        .ok_or_else(|| TangleError::ArithmeticOverflow("paid-out amounts".into()))?;
    let stem_amount = stem_input.as_ref().map(|s| s.output.amount).unwrap_or(0);
    let available = consumed_total
        .checked_add(inflation)
        .ok_or_else(|| TangleError::ArithmeticOverflow("inflation".into()))?;
    let tip_amount = available.checked_sub(paid_out).ok_or_else(|| {
        TangleError::ConstraintFailure(format!(
            "outputs {paid_out} exceed inputs {available} of the milestone"
        ))
    })?;

    let mut outputs = Vec::with_capacity(2 + additional_outputs.len());
    if stem_input.is_some() {
        // the stem value travels from stem to stem
        outputs.push(Output::new(stem_amount, Lock::Stem));
    }
    // the new tip stays under the consumed tip's lock
    outputs.push(Output::new(tip_amount, chain_input.output.lock.clone()).with_chain(chain_id));
    outputs.extend(additional_outputs);

    let tx = Transaction {
        slot,
        sequencer_id: Some(chain_id),
        stem_input: stem_input.as_ref().map(|s| s.id),
        inputs: std::iter::once(chain_input.id)
            .chain(additional_inputs.iter().map(|i| i.id))
            .collect(),
        endorsements,
        outputs,
        inflation,
    };
    tx.check_basic()?;
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AccountId {
        AccountId::new(vec![0xaa; 4]).unwrap()
    }

    #[test]
    fn genesis_shape() {
        let genesis = genesis_transaction(1_000_000, controller());
        assert!(genesis.is_genesis());
        assert!(genesis.is_branch());
        let total: u64 = genesis.outputs.iter().map(|o| o.amount).sum();
        assert_eq!(total, 1_000_000);
        assert!(produced_stem_output(&genesis).is_some());
        genesis.check_basic().unwrap();
    }

    #[test]
    fn milestone_collects_value_on_the_tip() {
        let genesis = genesis_transaction(1_000, controller());
        let chain = genesis_chain_id(&genesis);
        let tip = OutputWithId {
            id: genesis.id().output_id(1),
            output: genesis.outputs[1].clone(),
        };
        let tx = make_sequencer_transaction(SequencerTxParams {
            slot: Slot(1),
            chain_id: chain,
            chain_input: tip,
            stem_input: None,
            additional_inputs: Vec::new(),
            additional_outputs: vec![Output::new(
                500,
                Lock::Account(AccountId::new(vec![1]).unwrap()),
            )],
            endorsements: Vec::new(),
            inflation: 0,
        })
        .unwrap();
        assert!(!tx.is_branch());
        assert!(tx.is_sequencer());
        // tip keeps the rest
        assert_eq!(tx.outputs[0].amount, 500);
        assert_eq!(tx.outputs[0].chain_id, Some(chain));

        let resolve = |oid: &crate::types::OutputId| {
            (*oid == genesis.id().output_id(1)).then(|| genesis.outputs[1].clone())
        };
        tx.validate(resolve).unwrap();
    }

    #[test]
    fn branch_milestone_carries_the_stem() {
        let genesis = genesis_transaction(1_000, controller());
        let chain = genesis_chain_id(&genesis);
        let tx = make_sequencer_transaction(SequencerTxParams {
            slot: Slot(1),
            chain_id: chain,
            chain_input: OutputWithId {
                id: genesis.id().output_id(1),
                output: genesis.outputs[1].clone(),
            },
            stem_input: Some(OutputWithId {
                id: genesis.id().output_id(0),
                output: genesis.outputs[0].clone(),
            }),
            additional_inputs: Vec::new(),
            additional_outputs: Vec::new(),
            endorsements: Vec::new(),
            inflation: 50,
        })
        .unwrap();
        assert!(tx.is_branch());
        assert_eq!(tx.stem_input, Some(genesis.id().output_id(0)));
        assert!(tx.outputs[0].lock.is_stem());
        assert_eq!(tx.outputs[1].amount, 1_050);
    }

    #[test]
    fn overdrawn_milestone_is_rejected() {
        let genesis = genesis_transaction(100, controller());
        let chain = genesis_chain_id(&genesis);
        let err = make_sequencer_transaction(SequencerTxParams {
            slot: Slot(1),
            chain_id: chain,
            chain_input: OutputWithId {
                id: genesis.id().output_id(1),
                output: genesis.outputs[1].clone(),
            },
            stem_input: None,
            additional_inputs: Vec::new(),
            additional_outputs: vec![Output::new(
                101,
                Lock::Account(AccountId::new(vec![1]).unwrap()),
            )],
            endorsements: Vec::new(),
            inflation: 0,
        })
        .unwrap_err();
        assert!(matches!(err, TangleError::ConstraintFailure(_)));
    }
}
