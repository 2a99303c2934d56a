//! Attachment core of a cooperative-consensus UTXO tangle node.
//!
//! The crate keeps the in-memory DAG of wrapped transactions (`memdag`,
//! `vertex`), runs a per-transaction attacher state machine (`attacher`)
//! that solidifies past cones, selects baselines and computes ledger
//! coverage, and maintains the committed branch states in a persistent trie
//! (`trie`, `multistate`, `storage`). Around that core sit the pull client
//! for missing ancestors, the pruner reclaiming unreferenced subgraphs, and
//! the workflow glue with its event fan-out (`pull_client`, `pruner`,
//! `workflow`). The peer transport is external; `peering` carries the frame
//! codecs and the trait seam it plugs into.
//!
//! Applications depend on [`config::NodeConfig`] to bootstrap, [`node::Node`]
//! and [`node::NodeHandle`] to operate the core, and [`txbuilder`] to author
//! transactions.

pub mod attacher;
pub mod config;
pub mod errors;
pub mod memdag;
pub mod multistate;
pub mod node;
pub mod peering;
pub mod pruner;
pub mod pull_client;
pub mod storage;
pub mod trie;
pub mod txbuilder;
pub mod types;
pub mod vertex;
pub mod workflow;
