use serde::{Deserialize, Serialize};

use crate::errors::{TangleError, TangleResult};
use crate::types::{ChainId, OutputId};

/// Account under which every stem output is locked. A committed state holds
/// exactly one stem output; its presence defines the state tip within a slot.
pub const STEM_ACCOUNT_ID: &[u8] = b"$stem";

pub const MAX_ACCOUNT_ID_LENGTH: usize = 255;

/// Opaque account identifier used by the account index partition.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub Vec<u8>);

impl AccountId {
    pub fn new(data: impl Into<Vec<u8>>) -> TangleResult<Self> {
        let data = data.into();
        if data.is_empty() || data.len() > MAX_ACCOUNT_ID_LENGTH {
            return Err(TangleError::MalformedTx(format!(
                "account id length {} out of range",
                data.len()
            )));
        }
        Ok(AccountId(data))
    }

    pub fn stem() -> Self {
        AccountId(STEM_ACCOUNT_ID.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Lock constraint of an output. Script evaluation proper is delegated; the
/// core only needs to know which account indexes the output and whether it is
/// the stem.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lock {
    Account(AccountId),
    Stem,
}

impl Lock {
    pub fn account_id(&self) -> AccountId {
        match self {
            Lock::Account(account) => account.clone(),
            Lock::Stem => AccountId::stem(),
        }
    }

    pub fn is_stem(&self) -> bool {
        matches!(self, Lock::Stem)
    }

    /// Stable display form used for grouping in `accounts_by_locks`.
    pub fn to_display_string(&self) -> String {
        match self {
            Lock::Account(account) => format!("a({})", hex::encode(account.as_bytes())),
            Lock::Stem => "stem".to_string(),
        }
    }
}

/// A UTXO. `chain_id` present marks the output as the tip of a sequencer
/// chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    pub lock: Lock,
    pub chain_id: Option<ChainId>,
}

impl Output {
    pub fn new(amount: u64, lock: Lock) -> Self {
        Self {
            amount,
            lock,
            chain_id: None,
        }
    }

    pub fn with_chain(mut self, chain_id: ChainId) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("output encoding is infallible")
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// An output paired with its id, the unit the state readers hand out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputWithId {
    pub id: OutputId,
    pub output: Output,
}
