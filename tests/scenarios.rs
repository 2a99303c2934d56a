//! End-to-end scenarios of the attachment core, driven through the public
//! node handle: genesis bootstrap, chain building, missing ancestors,
//! double spends, branch inflation arithmetic and pruning.

use std::time::Duration;

use tangle_node::config::{LedgerParams, NodeConfig};
use tangle_node::errors::TangleError;
use tangle_node::node::{Node, NodeHandle};
use tangle_node::txbuilder::{
    genesis_chain_id, genesis_transaction, make_sequencer_transaction, SequencerTxParams,
};
use tangle_node::types::{
    AccountId, ChainId, Lock, Output, OutputWithId, Slot, Transaction, CHAIN_ORIGIN,
};
use tangle_node::vertex::Status;

const SUPPLY: u64 = 1_000_000;

fn controller() -> AccountId {
    AccountId::new(b"controller".to_vec()).unwrap()
}

fn account(name: &[u8]) -> AccountId {
    AccountId::new(name.to_vec()).unwrap()
}

fn test_node_with(ledger: LedgerParams) -> (tempfile::TempDir, Node, NodeHandle) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = NodeConfig {
        data_dir: dir.path().to_path_buf(),
        ledger,
        ..NodeConfig::default()
    };
    let node = Node::new(config).unwrap();
    node.start();
    let handle = node.handle();
    (dir, node, handle)
}

fn test_node() -> (tempfile::TempDir, Node, NodeHandle) {
    let ledger = LedgerParams {
        initial_supply: SUPPLY,
        ..LedgerParams::default()
    };
    test_node_with(ledger)
}

async fn ingest(handle: &NodeHandle, tx: &Transaction) -> Status {
    let txid = handle.tx_bytes_in(tx.to_bytes()).unwrap();
    assert_eq!(txid, tx.id());
    handle
        .attach(txid, Some(Duration::from_secs(10)))
        .await
        .unwrap()
}

fn output_with_id(tx: &Transaction, index: u8) -> OutputWithId {
    OutputWithId {
        id: tx.id().output_id(index),
        output: tx.outputs[index as usize].clone(),
    }
}

/// S1: a genesis branch on an empty store commits the configured supply.
#[tokio::test(flavor = "multi_thread")]
async fn s1_genesis_bootstraps_the_ledger() {
    let (_dir, node, handle) = test_node();
    let genesis = genesis_transaction(SUPPLY, controller());
    let genesis_id = genesis.id();

    assert_eq!(ingest(&handle, &genesis).await, Status::Good);

    let record = tangle_node::multistate::fetch_root_record(handle.storage(), &genesis_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.supply, SUPPLY);
    assert_eq!(record.slot_inflation, 0);
    assert_eq!(record.num_transactions, 1);

    let readable = handle.readable(&genesis_id).unwrap();
    let (slot, stem) = readable.stem().unwrap();
    assert_eq!(slot, Slot::ZERO);
    assert_eq!(stem.id, genesis_id.output_id(0));

    let chain = genesis_chain_id(&genesis);
    let info = readable.chain_info().unwrap();
    assert_eq!(info[&chain].balance, SUPPLY);
    assert!(info[&chain].is_branch);
    node.shutdown();
}

/// S2: a sequencer step moves 500 units off the chain; the next branch
/// checkpoint shows the new chain balance.
#[tokio::test(flavor = "multi_thread")]
async fn s2_simple_chain_build() {
    let (_dir, node, handle) = test_node();
    let genesis = genesis_transaction(SUPPLY, controller());
    let chain = genesis_chain_id(&genesis);
    assert_eq!(ingest(&handle, &genesis).await, Status::Good);

    let step = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(1),
        chain_id: chain,
        chain_input: output_with_id(&genesis, 1),
        stem_input: None,
        additional_inputs: Vec::new(),
        additional_outputs: vec![Output::new(500, Lock::Account(account(b"alice")))],
        endorsements: Vec::new(),
        inflation: 0,
    })
    .unwrap();
    assert_eq!(ingest(&handle, &step).await, Status::Good);

    // both vertices good; the transfer itself commits nothing
    assert_eq!(
        handle.dag().get_vertex(&genesis.id()).unwrap().status(),
        Status::Good
    );
    assert_eq!(
        handle.dag().get_vertex(&step.id()).unwrap().status(),
        Status::Good
    );

    // the next checkpoint includes the step and shows the moved balance
    let branch = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(2),
        chain_id: chain,
        chain_input: output_with_id(&step, 0),
        stem_input: Some(output_with_id(&genesis, 0)),
        additional_inputs: Vec::new(),
        additional_outputs: Vec::new(),
        endorsements: Vec::new(),
        inflation: 0,
    })
    .unwrap();
    assert_eq!(ingest(&handle, &branch).await, Status::Good);

    let readable = handle.readable(&branch.id()).unwrap();
    let info = readable.chain_info().unwrap();
    assert_eq!(info[&chain].balance, SUPPLY - 500);
    assert!(readable.knows_committed_transaction(&step.id()).unwrap());

    let alice = readable.utxos_locked_in_account(&account(b"alice")).unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].output.amount, 500);

    let record = tangle_node::multistate::fetch_root_record(handle.storage(), &branch.id())
        .unwrap()
        .unwrap();
    assert_eq!(record.supply, SUPPLY);
    assert_eq!(record.num_transactions, 2);
    node.shutdown();
}

/// S3: a transaction with an unknown ancestor stays undefined and keeps the
/// pull list busy; injecting the ancestor completes it within a poke cycle.
#[tokio::test(flavor = "multi_thread")]
async fn s3_missing_ancestor_resolves_after_injection() {
    let (_dir, node, handle) = test_node();
    let genesis = genesis_transaction(SUPPLY, controller());
    let chain = genesis_chain_id(&genesis);
    assert_eq!(ingest(&handle, &genesis).await, Status::Good);

    // A funds bob off the chain; B spends bob's output
    let tx_a = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(1),
        chain_id: chain,
        chain_input: output_with_id(&genesis, 1),
        stem_input: None,
        additional_inputs: Vec::new(),
        additional_outputs: vec![Output::new(300, Lock::Account(account(b"bob")))],
        endorsements: Vec::new(),
        inflation: 0,
    })
    .unwrap();
    let tx_b = Transaction {
        slot: Slot(2),
        sequencer_id: None,
        stem_input: None,
        inputs: vec![tx_a.id().output_id(1)],
        endorsements: Vec::new(),
        outputs: vec![Output::new(300, Lock::Account(account(b"carol")))],
        inflation: 0,
    };

    // B first: its ancestor A is unknown locally
    let txid_b = handle.tx_bytes_in(tx_b.to_bytes()).unwrap();
    let err = handle
        .attach(txid_b, Some(Duration::from_millis(400)))
        .await
        .unwrap_err();
    assert!(matches!(err, TangleError::Timeout(_)));
    assert_eq!(
        handle.dag().get_vertex(&txid_b).unwrap().status(),
        Status::Undefined
    );
    assert!(handle.is_pulling(&tx_a.id()));

    // the missing ancestor arrives; one poke cycle finishes B
    assert_eq!(ingest(&handle, &tx_a).await, Status::Good);
    let status = handle
        .attach(txid_b, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(status, Status::Good);
    assert!(!handle.is_pulling(&tx_a.id()));
    node.shutdown();
}

/// S4: two chains forking off the same origin output coexist, but a
/// milestone endorsing both sides finalises bad with a double spend.
#[tokio::test(flavor = "multi_thread")]
async fn s4_double_spend_in_past_cone() {
    let (_dir, node, handle) = test_node();
    let genesis = genesis_transaction(SUPPLY, controller());
    let chain = genesis_chain_id(&genesis);
    assert_eq!(ingest(&handle, &genesis).await, Status::Good);

    // F funds a fresh chain origin for A
    let tx_f = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(1),
        chain_id: chain,
        chain_input: output_with_id(&genesis, 1),
        stem_input: None,
        additional_inputs: Vec::new(),
        additional_outputs: vec![Output::new(200, Lock::Account(account(b"alice")))],
        endorsements: Vec::new(),
        inflation: 0,
    })
    .unwrap();
    assert_eq!(ingest(&handle, &tx_f).await, Status::Good);

    // A originates a side chain
    let tx_a = Transaction {
        slot: Slot(1),
        sequencer_id: None,
        stem_input: None,
        inputs: vec![tx_f.id().output_id(1)],
        endorsements: Vec::new(),
        outputs: vec![Output::new(200, Lock::Account(account(b"alice"))).with_chain(CHAIN_ORIGIN)],
        inflation: 0,
    };
    assert_eq!(ingest(&handle, &tx_a).await, Status::Good);
    let origin = tx_a.id().output_id(0);
    let side_chain = ChainId::from_origin(&origin);

    // B and C both advance the side chain from the same origin output
    let conflicting = |payout: &[u8]| {
        make_sequencer_transaction(SequencerTxParams {
            slot: Slot(2),
            chain_id: side_chain,
            chain_input: OutputWithId {
                id: origin,
                output: tx_a.outputs[0].clone(),
            },
            stem_input: None,
            additional_inputs: Vec::new(),
            additional_outputs: vec![Output::new(10, Lock::Account(account(payout)))],
            endorsements: Vec::new(),
            inflation: 0,
        })
        .unwrap()
    };
    let tx_b = conflicting(b"bob");
    let tx_c = conflicting(b"carol");
    assert_eq!(ingest(&handle, &tx_b).await, Status::Good);
    assert_eq!(ingest(&handle, &tx_c).await, Status::Good);

    // D endorses both sides of the conflict
    let tx_d = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(3),
        chain_id: chain,
        chain_input: output_with_id(&tx_f, 0),
        stem_input: None,
        additional_inputs: Vec::new(),
        additional_outputs: Vec::new(),
        endorsements: vec![tx_b.id(), tx_c.id()],
        inflation: 0,
    })
    .unwrap();
    let status = ingest(&handle, &tx_d).await;
    assert_eq!(status, Status::Bad);

    let vid_d = handle.dag().get_vertex(&tx_d.id()).unwrap();
    let err = vid_d.error().expect("error frozen on the vertex");
    assert!(
        matches!(&*err, TangleError::DoubleSpendInPastCone { output, .. } if *output == origin),
        "unexpected error: {err}"
    );

    // the conflict is a property of D's cone only
    for tx in [&tx_a, &tx_b, &tx_c] {
        assert_eq!(
            handle.dag().get_vertex(&tx.id()).unwrap().status(),
            Status::Good
        );
    }
    node.shutdown();
}

/// S5: branch coverage follows the ageing formula
/// `(prev_coverage >> slot_gap) + inflation`, and supply grows by the slot
/// inflation.
#[tokio::test(flavor = "multi_thread")]
async fn s5_branch_coverage_and_inflation_arithmetic() {
    let (_dir, node, handle) = test_node();
    let genesis = genesis_transaction(SUPPLY, controller());
    let chain = genesis_chain_id(&genesis);
    assert_eq!(ingest(&handle, &genesis).await, Status::Good);

    let genesis_record =
        tangle_node::multistate::fetch_root_record(handle.storage(), &genesis.id())
            .unwrap()
            .unwrap();
    assert_eq!(genesis_record.ledger_coverage, 1_000_000);

    let branch = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(1),
        chain_id: chain,
        chain_input: output_with_id(&genesis, 1),
        stem_input: Some(output_with_id(&genesis, 0)),
        additional_inputs: Vec::new(),
        additional_outputs: Vec::new(),
        endorsements: Vec::new(),
        inflation: 100,
    })
    .unwrap();
    assert_eq!(ingest(&handle, &branch).await, Status::Good);

    let record = tangle_node::multistate::fetch_root_record(handle.storage(), &branch.id())
        .unwrap()
        .unwrap();
    assert_eq!(record.ledger_coverage, (1_000_000 >> 1) + 100);
    assert_eq!(record.ledger_coverage, 500_100);
    assert_eq!(record.slot_inflation, 100);
    assert_eq!(record.supply, SUPPLY + 100);

    let vid = handle.dag().get_vertex(&branch.id()).unwrap();
    assert_eq!(vid.get_ledger_coverage(), Some(500_100));
    node.shutdown();
}

/// S6: once the last external reference is gone, a sweep period later the
/// vertex and its cached state reader are gone too.
#[tokio::test(flavor = "multi_thread")]
async fn s6_unreferenced_vertices_are_pruned() {
    let ledger = LedgerParams {
        initial_supply: SUPPLY,
        // fast sweeps: 40 ms slots, one-slot grace
        slot_duration_ms: 40,
        ..LedgerParams::default()
    };
    let (_dir, node, handle) = test_node_with(ledger);
    let genesis = genesis_transaction(SUPPLY, controller());
    let genesis_id = genesis.id();
    assert_eq!(ingest(&handle, &genesis).await, Status::Good);

    let vid = handle.dag().get_vertex(&genesis_id).unwrap();
    handle
        .dag()
        .get_state_reader_for_the_branch(&vid)
        .unwrap();
    assert_eq!(handle.dag().num_state_readers(), 1);
    drop(vid);

    // several sweep periods; the attacher references were released when the
    // attachment finished
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(handle.dag().get_vertex(&genesis_id).is_none());
    assert_eq!(handle.dag().num_state_readers(), 0);

    // the committed state itself survives pruning
    let readable = handle.readable(&genesis_id).unwrap();
    assert!(readable.knows_committed_transaction(&genesis_id).unwrap());
    node.shutdown();
}

/// Two nodes fed the same transactions write bit-identical root records.
#[tokio::test(flavor = "multi_thread")]
async fn root_records_are_bit_identical_across_nodes() {
    let (_dir1, node1, handle1) = test_node();
    let (_dir2, node2, handle2) = test_node();

    let genesis = genesis_transaction(SUPPLY, controller());
    let chain = genesis_chain_id(&genesis);
    let step = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(1),
        chain_id: chain,
        chain_input: output_with_id(&genesis, 1),
        stem_input: None,
        additional_inputs: Vec::new(),
        additional_outputs: vec![Output::new(777, Lock::Account(account(b"alice")))],
        endorsements: Vec::new(),
        inflation: 0,
    })
    .unwrap();
    let branch = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(2),
        chain_id: chain,
        chain_input: output_with_id(&step, 0),
        stem_input: Some(output_with_id(&genesis, 0)),
        additional_inputs: Vec::new(),
        additional_outputs: Vec::new(),
        endorsements: Vec::new(),
        inflation: 5,
    })
    .unwrap();

    for handle in [&handle1, &handle2] {
        assert_eq!(ingest(handle, &genesis).await, Status::Good);
        assert_eq!(ingest(handle, &step).await, Status::Good);
        assert_eq!(ingest(handle, &branch).await, Status::Good);
    }

    let raw1 = handle1
        .storage()
        .fetch_root_record_bytes(&branch.id())
        .unwrap()
        .unwrap();
    let raw2 = handle2
        .storage()
        .fetch_root_record_bytes(&branch.id())
        .unwrap()
        .unwrap();
    assert_eq!(raw1, raw2);

    // supply identity across the chain of branches
    let genesis_record =
        tangle_node::multistate::fetch_root_record(handle1.storage(), &genesis.id())
            .unwrap()
            .unwrap();
    let branch_record =
        tangle_node::multistate::fetch_root_record(handle1.storage(), &branch.id())
            .unwrap()
            .unwrap();
    assert_eq!(
        branch_record.supply,
        genesis_record.supply + branch_record.slot_inflation
    );
    node1.shutdown();
    node2.shutdown();
}

/// Inclusion scores over the last branches: weak counts branches, strong
/// weighs them by coverage.
#[tokio::test(flavor = "multi_thread")]
async fn inclusion_score_reflects_committed_branches() {
    let (_dir, node, handle) = test_node();
    let genesis = genesis_transaction(SUPPLY, controller());
    let chain = genesis_chain_id(&genesis);
    assert_eq!(ingest(&handle, &genesis).await, Status::Good);

    let step = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(1),
        chain_id: chain,
        chain_input: output_with_id(&genesis, 1),
        stem_input: None,
        additional_inputs: Vec::new(),
        additional_outputs: vec![Output::new(1, Lock::Account(account(b"alice")))],
        endorsements: Vec::new(),
        inflation: 0,
    })
    .unwrap();
    assert_eq!(ingest(&handle, &step).await, Status::Good);

    let branch = make_sequencer_transaction(SequencerTxParams {
        slot: Slot(2),
        chain_id: chain,
        chain_input: output_with_id(&step, 0),
        stem_input: Some(output_with_id(&genesis, 0)),
        additional_inputs: Vec::new(),
        additional_outputs: Vec::new(),
        endorsements: Vec::new(),
        inflation: 0,
    })
    .unwrap();
    assert_eq!(ingest(&handle, &branch).await, Status::Good);

    // the step is committed by the slot-2 branch only
    let score = handle
        .query_tx_inclusion_score(&step.id(), 2, 3, 4)
        .unwrap();
    assert_eq!(score.weak_score, 50);
    assert!(score.inclusion.len() == 2);
    assert_eq!(score.earliest_slot, Slot(0));
    assert_eq!(score.latest_slot, Slot(2));

    // the genesis id is known to both committed states
    let score = handle
        .query_tx_inclusion_score(&genesis.id(), 2, 3, 4)
        .unwrap();
    assert_eq!(score.weak_score, 100);
    assert_eq!(score.strong_score, 100);
    node.shutdown();
}
