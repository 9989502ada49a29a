//! The hash set used across the node: SHA-256 and its double/truncated
//! variants, plus HASH160 for address derivation on both chains.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA-256, the external chain's block/transaction hash.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// RIPEMD-160 of SHA-256, used for public-key and script hashes.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(sha256(data)).into()
}

/// First 24 bytes of SHA-256.
///
/// This is the canonical short hash the AT machine uses to fingerprint
/// transaction signatures inside register lanes A2..A4, so it must stay
/// byte-identical across implementations.
pub fn sha192(data: &[u8]) -> [u8; 24] {
    let full = sha256(data);
    let mut out = [0u8; 24];
    out.copy_from_slice(&full[..24]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha256_empty() {
        assert_eq!(
            sha256(b""),
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn hash256_empty() {
        assert_eq!(
            hash256(b""),
            hex!("5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456")
        );
    }

    #[test]
    fn hash160_empty() {
        assert_eq!(hash160(b""), hex!("b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"));
    }

    #[test]
    fn sha192_is_sha256_prefix() {
        let data = b"quarry";
        assert_eq!(sha192(data), sha256(data)[..24]);
    }
}
