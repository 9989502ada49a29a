use crate::{CodecError, Result, hash::hash256};

/// Encode `version ‖ payload ‖ checksum` where the checksum is the first
/// four bytes of double SHA-256 over `version ‖ payload`.
pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    let mut raw = Vec::with_capacity(1 + payload.len() + 4);
    raw.push(version);
    raw.extend_from_slice(payload);
    let checksum = hash256(&raw);
    raw.extend_from_slice(&checksum[..4]);
    bs58::encode(raw).into_string()
}

/// Decode a Base58Check string, verifying the checksum, and return the
/// version byte and payload.
pub fn base58check_decode(s: &str) -> Result<(u8, Vec<u8>)> {
    let raw = bs58::decode(s)
        .into_vec()
        .map_err(|_| CodecError::BadBase58)?;
    if raw.len() < 5 {
        return Err(CodecError::BadBase58);
    }
    let (body, checksum) = raw.split_at(raw.len() - 4);
    let computed = hash256(body);
    if checksum != &computed[..4] {
        return Err(CodecError::BadChecksum);
    }
    Ok((body[0], body[1..].to_vec()))
}
