use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{TangleError, TangleResult};

pub const TRANSACTION_ID_LENGTH: usize = 32;
pub const OUTPUT_ID_LENGTH: usize = TRANSACTION_ID_LENGTH + 1;
pub const CHAIN_ID_LENGTH: usize = 32;
pub const COMMITMENT_LENGTH: usize = 32;

const FLAG_SEQUENCER: u8 = 0b0000_0001;
const FLAG_BRANCH: u8 = 0b0000_0010;

/// Ledger epoch. Slot 0 is the genesis slot.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Slot(pub u32);

impl Slot {
    pub const ZERO: Slot = Slot(0);

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        let arr: [u8; 4] = data
            .try_into()
            .map_err(|_| TangleError::MalformedTx(format!("wrong slot length {}", data.len())))?;
        Ok(Slot(u32::from_be_bytes(arr)))
    }

    pub fn next(self) -> Slot {
        Slot(self.0 + 1)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identity on the tangle. Layout: 4-byte big-endian slot,
/// 1 flag byte (sequencer, branch), 27 bytes of the body hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub [u8; TRANSACTION_ID_LENGTH]);

impl TransactionId {
    pub fn new(slot: Slot, sequencer: bool, branch: bool, body_hash: &[u8; 32]) -> Self {
        let mut id = [0u8; TRANSACTION_ID_LENGTH];
        id[..4].copy_from_slice(&slot.to_bytes());
        let mut flags = 0u8;
        if sequencer {
            flags |= FLAG_SEQUENCER;
        }
        if branch {
            flags |= FLAG_BRANCH;
        }
        id[4] = flags;
        id[5..].copy_from_slice(&body_hash[..TRANSACTION_ID_LENGTH - 5]);
        TransactionId(id)
    }

    pub fn slot(&self) -> Slot {
        Slot(u32::from_be_bytes([
            self.0[0], self.0[1], self.0[2], self.0[3],
        ]))
    }

    pub fn is_sequencer(&self) -> bool {
        self.0[4] & FLAG_SEQUENCER != 0
    }

    pub fn is_branch(&self) -> bool {
        self.0[4] & FLAG_BRANCH != 0
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_LENGTH] {
        &self.0
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        let arr: [u8; TRANSACTION_ID_LENGTH] = data.try_into().map_err(|_| {
            TangleError::MalformedTx(format!("wrong transaction id length {}", data.len()))
        })?;
        Ok(TransactionId(arr))
    }

    pub fn output_id(&self, index: u8) -> OutputId {
        OutputId::new(*self, index)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.slot(), hex::encode(&self.0[4..10]))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Output identity: transaction id plus the output index inside it.
/// Serialized as a raw byte string; the width exceeds what serde derives
/// for arrays.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputId(pub [u8; OUTPUT_ID_LENGTH]);

impl Serialize for OutputId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for OutputId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OutputIdVisitor;

        impl<'de> serde::de::Visitor<'de> for OutputIdVisitor {
            type Value = OutputId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{OUTPUT_ID_LENGTH} output id bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<OutputId, E> {
                OutputId::from_bytes(v).map_err(|_| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<OutputId, A::Error> {
                let mut bytes = [0u8; OUTPUT_ID_LENGTH];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(OutputId(bytes))
            }
        }

        deserializer.deserialize_bytes(OutputIdVisitor)
    }
}

impl OutputId {
    pub fn new(txid: TransactionId, index: u8) -> Self {
        let mut id = [0u8; OUTPUT_ID_LENGTH];
        id[..TRANSACTION_ID_LENGTH].copy_from_slice(txid.as_bytes());
        id[TRANSACTION_ID_LENGTH] = index;
        OutputId(id)
    }

    pub fn transaction_id(&self) -> TransactionId {
        let mut txid = [0u8; TRANSACTION_ID_LENGTH];
        txid.copy_from_slice(&self.0[..TRANSACTION_ID_LENGTH]);
        TransactionId(txid)
    }

    pub fn index(&self) -> u8 {
        self.0[TRANSACTION_ID_LENGTH]
    }

    pub fn slot(&self) -> Slot {
        self.transaction_id().slot()
    }

    pub fn as_bytes(&self) -> &[u8; OUTPUT_ID_LENGTH] {
        &self.0
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        let arr: [u8; OUTPUT_ID_LENGTH] = data.try_into().map_err(|_| {
            TangleError::MalformedTx(format!("wrong output id length {}", data.len()))
        })?;
        Ok(OutputId(arr))
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.transaction_id(), self.index())
    }
}

impl fmt::Debug for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Identity of a sequencer chain, derived from the chain's origin output.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId(pub [u8; CHAIN_ID_LENGTH]);

impl ChainId {
    pub fn from_origin(origin: &OutputId) -> Self {
        ChainId(*blake3::hash(origin.as_bytes()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; CHAIN_ID_LENGTH] {
        &self.0
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        let arr: [u8; CHAIN_ID_LENGTH] = data.try_into().map_err(|_| {
            TangleError::MalformedTx(format!("wrong chain id length {}", data.len()))
        })?;
        Ok(ChainId(arr))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Root hash of the trie representing a committed state. The all-zero value
/// is the empty-state sentinel.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Commitment(pub [u8; COMMITMENT_LENGTH]);

impl Commitment {
    pub const EMPTY: Commitment = Commitment([0u8; COMMITMENT_LENGTH]);

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn as_bytes(&self) -> &[u8; COMMITMENT_LENGTH] {
        &self.0
    }

    pub fn from_bytes(data: &[u8]) -> TangleResult<Self> {
        let arr: [u8; COMMITMENT_LENGTH] = data.try_into().map_err(|_| {
            TangleError::MalformedTx(format!("wrong commitment length {}", data.len()))
        })?;
        Ok(Commitment(arr))
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_encodes_slot_and_flags() {
        let hash = *blake3::hash(b"body").as_bytes();
        let txid = TransactionId::new(Slot(7), true, true, &hash);
        assert_eq!(txid.slot(), Slot(7));
        assert!(txid.is_sequencer());
        assert!(txid.is_branch());

        let plain = TransactionId::new(Slot(7), false, false, &hash);
        assert!(!plain.is_sequencer());
        assert!(!plain.is_branch());
        assert_ne!(txid, plain);
    }

    #[test]
    fn output_id_splits_back() {
        let hash = *blake3::hash(b"body").as_bytes();
        let txid = TransactionId::new(Slot(3), true, false, &hash);
        let oid = txid.output_id(5);
        assert_eq!(oid.transaction_id(), txid);
        assert_eq!(oid.index(), 5);
        assert_eq!(oid.slot(), Slot(3));

        let back = OutputId::from_bytes(oid.as_bytes()).unwrap();
        assert_eq!(back, oid);
    }

    #[test]
    fn id_ordering_is_byte_order() {
        let hash = *blake3::hash(b"x").as_bytes();
        let a = TransactionId::new(Slot(1), false, false, &hash);
        let b = TransactionId::new(Slot(2), false, false, &hash);
        assert!(a < b);
    }
}
