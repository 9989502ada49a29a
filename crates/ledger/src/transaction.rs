use quarry_codec::{ByteReader, CodecError, hash::sha256};

use crate::{Address, AtTimestamp};

pub const TYPE_PAYMENT: u16 = 2;
pub const TYPE_AT: u16 = 16;
pub const TYPE_MESSAGE: u16 = 17;

/// Group id carried by transactions that belong to no group, including
/// everything an AT emits.
pub const NO_GROUP: u32 = 0;

/// The transaction kinds the AT engine can observe or emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionKind {
    Payment {
        recipient: Address,
        amount: u64,
    },
    Message {
        recipient: Address,
        payload: Vec<u8>,
    },
    /// AT-emitted. With an amount it behaves as a payment, without one as
    /// a message; the VM's type getter follows that rule.
    At {
        recipient: Address,
        amount: Option<u64>,
        payload: Vec<u8>,
    },
}

impl TransactionKind {
    pub const fn type_code(&self) -> u16 {
        match self {
            Self::Payment { .. } => TYPE_PAYMENT,
            Self::Message { .. } => TYPE_MESSAGE,
            Self::At { .. } => TYPE_AT,
        }
    }

    pub const fn recipient(&self) -> &Address {
        match self {
            Self::Payment { recipient, .. }
            | Self::Message { recipient, .. }
            | Self::At { recipient, .. } => recipient,
        }
    }

    /// Amount transferred, if this kind moves funds.
    pub const fn amount(&self) -> Option<u64> {
        match self {
            Self::Payment { amount, .. } => Some(*amount),
            Self::At { amount, .. } => *amount,
            Self::Message { .. } => None,
        }
    }

    /// Message payload, if this kind carries one.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Message { payload, .. } | Self::At { payload, .. } => Some(payload),
            Self::Payment { .. } => None,
        }
    }
}

/// A confirmed or emitted transaction.
///
/// `timestamp` is the packed (height, sequence) position: for confirmed
/// transactions their position in the chain, for emissions the slot the
/// runner assigns. The wire layout below is consensus-critical; emitted
/// transactions must serialize identically to hand-built ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionData {
    pub kind: TransactionKind,
    pub timestamp: AtTimestamp,
    pub group_id: u32,
    pub reference: [u8; 64],
    pub creator_public_key: [u8; 32],
    pub fee: u64,
    pub signature: [u8; 64],
}

impl TransactionData {
    /// Wire layout, all integers little-endian:
    /// type u16 ‖ timestamp u64 ‖ group u32 ‖ reference 64 ‖ creator 32 ‖
    /// recipient 25 ‖ kind fields ‖ fee u64 ‖ signature 64.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.signable_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    /// Everything except the trailing signature.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&self.kind.type_code().to_le_bytes());
        out.extend_from_slice(&self.timestamp.packed().to_le_bytes());
        out.extend_from_slice(&self.group_id.to_le_bytes());
        out.extend_from_slice(&self.reference);
        out.extend_from_slice(&self.creator_public_key);
        out.extend_from_slice(&self.kind.recipient().to_raw());
        match &self.kind {
            TransactionKind::Payment { amount, .. } => {
                out.extend_from_slice(&amount.to_le_bytes());
            }
            TransactionKind::Message { payload, .. } => {
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                out.extend_from_slice(payload);
            }
            TransactionKind::At {
                amount, payload, ..
            } => {
                out.push(u8::from(amount.is_some()));
                out.extend_from_slice(&amount.unwrap_or(0).to_le_bytes());
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                out.extend_from_slice(payload);
            }
        }
        out.extend_from_slice(&self.fee.to_le_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let type_code = reader.u16()?;
        let timestamp = AtTimestamp::from_packed(reader.u64()?);
        let group_id = reader.u32()?;
        let reference: [u8; 64] = reader.array()?;
        let creator_public_key: [u8; 32] = reader.array()?;
        let recipient = Address::from_raw(&reader.array()?)?;
        let kind = match type_code {
            TYPE_PAYMENT => TransactionKind::Payment {
                recipient,
                amount: reader.u64()?,
            },
            TYPE_MESSAGE => {
                let len = reader.u32()? as usize;
                TransactionKind::Message {
                    recipient,
                    payload: reader.take(len)?.to_vec(),
                }
            }
            TYPE_AT => {
                let has_amount = reader.u8()? != 0;
                let amount = reader.u64()?;
                let len = reader.u32()? as usize;
                TransactionKind::At {
                    recipient,
                    amount: has_amount.then_some(amount),
                    payload: reader.take(len)?.to_vec(),
                }
            }
            _ => return Err(CodecError::LengthOutOfRange),
        };
        let fee = reader.u64()?;
        let signature: [u8; 64] = reader.array()?;
        reader.finish()?;
        Ok(Self {
            kind,
            timestamp,
            group_id,
            reference,
            creator_public_key,
            fee,
            signature,
        })
    }

    /// Deterministic signature for AT-emitted transactions.
    ///
    /// ATs hold no keys, so their transactions carry a hash-chain in the
    /// signature slot: SHA-256 of the signable bytes followed by a second
    /// SHA-256 of that digest. Deterministic across nodes, and unique per
    /// transaction body, which is what the reference chain needs.
    pub fn apply_at_signature(&mut self) {
        let first = sha256(&self.signable_bytes());
        let second = sha256(&first);
        self.signature[..32].copy_from_slice(&first);
        self.signature[32..].copy_from_slice(&second);
    }
}
