use strum::FromRepr;

/// The CIYAM AT v2 instruction set.
///
/// Byte codes are consensus-stable; a deployed AT's bytecode is decoded
/// against exactly this table forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum OpCode {
    /// data[addr] = value
    SetVal = 0x01,
    /// data[a1] = data[a2]
    SetDat = 0x02,
    /// data[addr] = 0
    ClrDat = 0x03,
    IncDat = 0x04,
    DecDat = 0x05,
    AddDat = 0x06,
    SubDat = 0x07,
    MulDat = 0x08,
    /// Division by zero is a program error.
    DivDat = 0x09,
    BorDat = 0x0a,
    AndDat = 0x0b,
    XorDat = 0x0c,
    NotDat = 0x0d,
    /// data[a1] = data[data[a2]]
    SetInd = 0x0e,
    /// data[a1] = data[data[a2] + data[a3]]
    SetIdx = 0x0f,
    PshDat = 0x10,
    PopDat = 0x11,
    JmpSub = 0x12,
    RetSub = 0x13,
    /// data[data[a1]] = data[a2]
    IndDat = 0x14,
    /// data[data[a1] + data[a2]] = data[a3]
    IdxDat = 0x15,
    ModDat = 0x16,
    ShlDat = 0x17,
    ShrDat = 0x18,
    JmpAdr = 0x1a,
    /// Branch if data[addr] == 0, signed byte offset from instruction start.
    BzrDat = 0x1b,
    BnzDat = 0x1e,
    BgtDat = 0x1f,
    BltDat = 0x20,
    BgeDat = 0x21,
    BleDat = 0x22,
    BeqDat = 0x23,
    BneDat = 0x24,
    /// Sleep until the block height of the packed timestamp in data[addr].
    SlpDat = 0x25,
    /// Finish if data[addr] == 0.
    FizDat = 0x26,
    /// Stop if data[addr] == 0.
    StzDat = 0x27,
    FinImd = 0x28,
    StpImd = 0x29,
    /// Sleep a single block.
    SlpImd = 0x2a,
    ErrAdr = 0x2b,
    ExtFun = 0x32,
    ExtFunDat = 0x33,
    ExtFunDat2 = 0x34,
    ExtFunRet = 0x35,
    ExtFunRetDat = 0x36,
    ExtFunRetDat2 = 0x37,
    Nop = 0x7f,
}

impl OpCode {
    /// Full instruction length in bytes, opcode included.
    pub const fn size(self) -> u32 {
        match self {
            Self::RetSub | Self::FinImd | Self::StpImd | Self::SlpImd | Self::Nop => 1,
            Self::ExtFun => 3,
            Self::ClrDat
            | Self::IncDat
            | Self::DecDat
            | Self::NotDat
            | Self::PshDat
            | Self::PopDat
            | Self::JmpSub
            | Self::JmpAdr
            | Self::SlpDat
            | Self::FizDat
            | Self::StzDat
            | Self::ErrAdr => 5,
            Self::BzrDat | Self::BnzDat => 6,
            Self::ExtFunDat | Self::ExtFunRet => 7,
            Self::SetDat
            | Self::AddDat
            | Self::SubDat
            | Self::MulDat
            | Self::DivDat
            | Self::BorDat
            | Self::AndDat
            | Self::XorDat
            | Self::ModDat
            | Self::ShlDat
            | Self::ShrDat
            | Self::SetInd
            | Self::IndDat => 9,
            Self::BgtDat
            | Self::BltDat
            | Self::BgeDat
            | Self::BleDat
            | Self::BeqDat
            | Self::BneDat => 10,
            Self::ExtFunDat2 | Self::ExtFunRetDat => 11,
            Self::SetVal | Self::SetIdx | Self::IdxDat => 13,
            Self::ExtFunRetDat2 => 15,
        }
    }

    /// Whether this opcode dispatches through the platform-function table.
    /// Only these are charged `steps_per_function_call`; every other
    /// opcode costs a single step.
    pub const fn is_external(self) -> bool {
        matches!(
            self,
            Self::ExtFun
                | Self::ExtFunDat
                | Self::ExtFunDat2
                | Self::ExtFunRet
                | Self::ExtFunRetDat
                | Self::ExtFunRetDat2
        )
    }

    pub const fn step_cost(self, steps_per_function_call: u32) -> u32 {
        if self.is_external() {
            steps_per_function_call
        } else {
            1
        }
    }
}
