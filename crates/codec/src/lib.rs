//! Byte-level primitives shared by the ledger and the AT engine.
//!
//! Everything that touches a consensus-critical byte layout goes through
//! this crate: little-endian integer packing, the hash set used to
//! fingerprint signatures and derive addresses, and Base58Check with
//! explicit checksum verification.

mod address;
mod base58;
mod error;
pub mod hash;
mod reader;

pub use self::{
    address::{
        ACCOUNT_VERSION, AT_VERSION, RAW_ADDRESS_LENGTH, address_from_public_key, at_address,
        decode_address, encode_raw_address, is_valid_address,
    },
    base58::{base58check_decode, base58check_encode},
    error::{CodecError, Result},
    reader::ByteReader,
};
