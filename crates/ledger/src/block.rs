/// A block as the AT subsystem sees it: height and signature. Everything
/// else about block validation happens outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub height: u32,
    pub signature: [u8; 64],
}

/// Lightweight (height, signature) pair for windowed lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub height: u32,
    pub signature: [u8; 64],
}

impl From<&BlockData> for BlockSummary {
    fn from(block: &BlockData) -> Self {
        Self {
            height: block.height,
            signature: block.signature,
        }
    }
}
