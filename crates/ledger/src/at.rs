use crate::Address;

/// Per-deployment AT metadata plus the opaque machine-state blob.
///
/// The flags mirror the flags byte inside the blob so the runner can
/// decide whether to skip an AT without deserializing its state. The
/// balance lives on the AT's account and is read through the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtData {
    pub address: Address,
    pub creator_public_key: [u8; 32],
    pub creation_height: u32,
    pub asset_id: u64,
    pub stopped: bool,
    pub finished: bool,
    pub frozen: bool,
    pub sleeping: bool,
    pub sleep_until_height: u32,
    pub state: Vec<u8>,
}

impl AtData {
    /// A freshly deployed AT: address derived from the creator and the
    /// deployment transaction's signature, all flags clear.
    pub fn new(
        creator_public_key: [u8; 32],
        creation_reference: &[u8; 64],
        creation_height: u32,
        asset_id: u64,
        state: Vec<u8>,
    ) -> Self {
        Self {
            address: Address::for_at(&creator_public_key, creation_reference),
            creator_public_key,
            creation_height,
            asset_id,
            stopped: false,
            finished: false,
            frozen: false,
            sleeping: false,
            sleep_until_height: 0,
            state,
        }
    }

    pub const fn creator_public_key(&self) -> &[u8; 32] {
        &self.creator_public_key
    }
}
