use std::io;

use thiserror::Error;

use crate::types::{OutputId, TransactionId};

#[derive(Debug, Error)]
pub enum TangleError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed transaction: {0}")]
    MalformedTx(String),
    #[error("missing ancestor {0}")]
    MissingAncestor(TransactionId),
    #[error("conflicting baselines: {0}")]
    ConflictingBaselines(String),
    #[error("double spend in the past cone: output {output} consumed by {consumer1} and {consumer2}")]
    DoubleSpendInPastCone {
        output: OutputId,
        consumer1: TransactionId,
        consumer2: TransactionId,
    },
    #[error("constraint failure: {0}")]
    ConstraintFailure(String),
    #[error("arithmetic overflow: {0}")]
    ArithmeticOverflow(String),
    #[error("attacher timeout for {0}")]
    Timeout(TransactionId),
    #[error("attacher cancelled for {0}")]
    Cancelled(TransactionId),
    #[error("input queue overflow")]
    QueueOverflow,
    #[error("configuration error: {0}")]
    Config(String),
}

impl TangleError {
    /// A retryable fault: the attacher sleeps on its poke channel instead of
    /// terminating the target.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TangleError::MissingAncestor(_))
    }
}

pub type TangleResult<T> = Result<T, TangleError>;
