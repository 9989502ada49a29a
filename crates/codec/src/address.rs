use crate::{
    CodecError, Result,
    base58::{base58check_decode, base58check_encode},
    hash::hash160,
};

/// Version byte for account addresses. Yields the `Q` prefix in Base58.
pub const ACCOUNT_VERSION: u8 = 0x3a;

/// Version byte for AT addresses. Yields the `A` prefix in Base58.
pub const AT_VERSION: u8 = 0x17;

/// Length of a raw (Base58Check-decoded) address: version ‖ hash ‖ checksum.
pub const RAW_ADDRESS_LENGTH: usize = 25;

/// Derive the account address for a 32-byte public key.
pub fn address_from_public_key(public_key: &[u8; 32]) -> String {
    base58check_encode(ACCOUNT_VERSION, &hash160(public_key))
}

/// Derive an AT's address from its creator's public key and the signature
/// of the deployment transaction. Collisions are impossible under the
/// hash assumption, so the address is the AT's identity.
pub fn at_address(creator_public_key: &[u8; 32], creation_reference: &[u8; 64]) -> String {
    let mut preimage = Vec::with_capacity(32 + 64);
    preimage.extend_from_slice(creator_public_key);
    preimage.extend_from_slice(creation_reference);
    base58check_encode(AT_VERSION, &hash160(&preimage))
}

/// Whether `s` is a well-formed account address (version, length, checksum).
pub fn is_valid_address(s: &str) -> bool {
    matches!(base58check_decode(s), Ok((ACCOUNT_VERSION, payload)) if payload.len() == 20)
}

/// Decode an account or AT address into its raw 25-byte form.
pub fn decode_address(s: &str) -> Result<[u8; RAW_ADDRESS_LENGTH]> {
    let (version, payload) = base58check_decode(s)?;
    if payload.len() != 20 || !(version == ACCOUNT_VERSION || version == AT_VERSION) {
        return Err(CodecError::InvalidAddress);
    }
    let raw = bs58::decode(s)
        .into_vec()
        .map_err(|_| CodecError::BadBase58)?;
    raw.try_into().map_err(|_| CodecError::InvalidAddress)
}

/// Re-encode a raw 25-byte address back to its Base58 string form,
/// re-verifying the embedded checksum.
pub fn encode_raw_address(raw: &[u8; RAW_ADDRESS_LENGTH]) -> Result<String> {
    let s = bs58::encode(raw).into_string();
    base58check_decode(&s)?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_addresses_start_with_q() {
        let address = address_from_public_key(&[7u8; 32]);
        assert!(address.starts_with('Q'), "got {address}");
        assert!(is_valid_address(&address));
    }

    #[test]
    fn at_addresses_start_with_a() {
        let address = at_address(&[1u8; 32], &[2u8; 64]);
        assert!(address.starts_with('A'), "got {address}");
        // AT addresses are not account addresses
        assert!(!is_valid_address(&address));
    }

    #[test]
    fn at_address_is_deterministic() {
        let a = at_address(&[1u8; 32], &[2u8; 64]);
        let b = at_address(&[1u8; 32], &[2u8; 64]);
        let c = at_address(&[1u8; 32], &[3u8; 64]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn raw_round_trip() {
        let address = address_from_public_key(&[9u8; 32]);
        let raw = decode_address(&address).unwrap();
        assert_eq!(encode_raw_address(&raw).unwrap(), address);
    }

    #[test]
    fn invalid_addresses_rejected() {
        assert!(!is_valid_address(""));
        assert!(!is_valid_address("Qnotanaddress"));
        // bitcoin mainnet P2PKH has the wrong version byte
        assert!(!is_valid_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
    }
}
