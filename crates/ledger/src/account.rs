use core::fmt::{self, Display};
use core::str::FromStr;

use quarry_codec::{
    CodecError, RAW_ADDRESS_LENGTH, address_from_public_key, at_address, decode_address,
    encode_raw_address,
};

/// A native-chain address, account (`Q…`) or AT (`A…`).
///
/// Always holds a string that survived Base58Check validation, so
/// re-deriving the raw 25-byte form cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(String);

impl Address {
    /// Account address for a 32-byte public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(address_from_public_key(public_key))
    }

    /// AT address derived from the creator's public key and the signature
    /// of the deployment transaction.
    pub fn for_at(creator_public_key: &[u8; 32], creation_reference: &[u8; 64]) -> Self {
        Self(at_address(creator_public_key, creation_reference))
    }

    pub fn from_raw(raw: &[u8; RAW_ADDRESS_LENGTH]) -> Result<Self, CodecError> {
        encode_raw_address(raw).map(Self)
    }

    pub fn to_raw(&self) -> [u8; RAW_ADDRESS_LENGTH] {
        decode_address(&self.0).unwrap_or_else(|_| unreachable!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_address(s)?;
        Ok(Self(s.to_owned()))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
