mod ids;
mod output;
mod transaction;

pub use ids::{
    ChainId, Commitment, OutputId, Slot, TransactionId, CHAIN_ID_LENGTH, COMMITMENT_LENGTH,
    OUTPUT_ID_LENGTH, TRANSACTION_ID_LENGTH,
};
pub use output::{
    AccountId, Lock, Output, OutputWithId, MAX_ACCOUNT_ID_LENGTH, STEM_ACCOUNT_ID,
};
pub use transaction::{
    split_tx_bytes_with_metadata, PortionInfo, Transaction, TxMetadata, TxSource, CHAIN_ORIGIN,
    MAX_ENDORSEMENTS, MAX_INPUTS, MAX_OUTPUTS,
};
