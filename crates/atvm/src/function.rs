use strum::FromRepr;

/// Platform-function codes dispatched by the `ExtFun*` opcode family.
///
/// Codes are 16-bit and consensus-stable. `0x01xx` operate purely on the
/// A/B registers, `0x02xx` hash between them, `0x03xx` reach into the
/// chain, `0x04xx` touch balances and emit transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum FunctionCode {
    GetA1 = 0x0100,
    GetA2 = 0x0101,
    GetA3 = 0x0102,
    GetA4 = 0x0103,
    GetB1 = 0x0104,
    GetB2 = 0x0105,
    GetB3 = 0x0106,
    GetB4 = 0x0107,
    SetA1 = 0x0110,
    SetA2 = 0x0111,
    SetA3 = 0x0112,
    SetA4 = 0x0113,
    SetA1A2 = 0x0114,
    SetA3A4 = 0x0115,
    SetB1 = 0x0116,
    SetB2 = 0x0117,
    SetB3 = 0x0118,
    SetB4 = 0x0119,
    SetB1B2 = 0x011a,
    SetB3B4 = 0x011b,
    ClearA = 0x0120,
    ClearB = 0x0121,
    ClearBoth = 0x0122,
    CopyAFromB = 0x0123,
    CopyBFromA = 0x0124,
    CheckAIsZero = 0x0125,
    CheckBIsZero = 0x0126,
    CheckAEqualsB = 0x0127,
    SwapAB = 0x0128,
    OrAWithB = 0x0129,
    OrBWithA = 0x012a,
    AndAWithB = 0x012b,
    AndBWithA = 0x012c,
    XorAWithB = 0x012d,
    XorBWithA = 0x012e,
    Hash160AToB = 0x0202,
    CheckHash160AWithB = 0x0203,
    Sha256AToB = 0x0204,
    CheckSha256AWithB = 0x0205,
    GetBlockTimestamp = 0x0300,
    GetCreationTimestamp = 0x0301,
    GetLastBlockTimestamp = 0x0302,
    PutLastBlockHashInA = 0x0303,
    ATxAfterTimestamp = 0x0304,
    GetTypeForTxInA = 0x0305,
    GetAmountForTxInA = 0x0306,
    GetTimestampForTxInA = 0x0307,
    GetRandomIdForTxInA = 0x0308,
    MessageFromTxInAToB = 0x0309,
    BToAddressOfTxInA = 0x030a,
    BToAddressOfCreator = 0x030b,
    GetCurrentBalance = 0x0400,
    GetPreviousBalance = 0x0401,
    SendToAddressInB = 0x0402,
    SendAllToAddressInB = 0x0403,
    SendOldToAddressInB = 0x0404,
    SendAToAddressInB = 0x0405,
    AddMinutesToTimestamp = 0x0406,
}
