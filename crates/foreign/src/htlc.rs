use bitcoin::{
    Address, Network, ScriptBuf,
    opcodes::{
        OP_FALSE,
        all::{
            OP_CHECKSIG, OP_CLTV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_HASH160,
            OP_IF, OP_SIZE,
        },
    },
    script::{Builder, Instruction, Script},
};

use crate::{ForeignError, Result};

/// HTLC secrets are SHA-256 sized; the script pins this with `OP_SIZE`.
pub const SECRET_LENGTH: usize = 32;

/// The four values that define a hash-time-locked contract. Its
/// canonical serialization is the redeem script; its address is the
/// Base58Check P2SH of that script's HASH160.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtlcParams {
    pub refunder_pkh: [u8; 20],
    pub redeemer_pkh: [u8; 20],
    pub secret_hash: [u8; 20],
    /// Median-time-past threshold in seconds.
    pub lock_time: u32,
}

impl HtlcParams {
    /// The canonical redeem script. Every byte is part of the external
    /// interface: any deviation changes the P2SH address.
    ///
    /// ```text
    /// OP_IF
    ///     OP_SIZE <32> OP_EQUALVERIFY
    ///     OP_HASH160 <secretHash> OP_EQUALVERIFY
    ///     OP_DUP OP_HASH160 <redeemerPKH>
    /// OP_ELSE
    ///     <lockTime> OP_CHECKLOCKTIMEVERIFY OP_DROP
    ///     OP_DUP OP_HASH160 <refunderPKH>
    /// OP_ENDIF
    /// OP_EQUALVERIFY OP_CHECKSIG
    /// ```
    pub fn redeem_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(OP_IF)
            .push_opcode(OP_SIZE)
            .push_int(SECRET_LENGTH as i64)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_HASH160)
            .push_slice(self.secret_hash)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(self.redeemer_pkh)
            .push_opcode(OP_ELSE)
            .push_int(i64::from(self.lock_time))
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(self.refunder_pkh)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// Exact inverse of [`Self::redeem_script`]; anything that is not the
    /// canonical byte sequence is rejected.
    pub fn parse(script: &Script) -> Result<Self> {
        let mut reader = ScriptReader::new(script);
        reader.op(OP_IF.to_u8())?;
        reader.op(OP_SIZE.to_u8())?;
        let secret_len = reader.push_int()?;
        if secret_len != SECRET_LENGTH as i64 {
            return Err(ForeignError::invalid("unexpected secret length"));
        }
        reader.op(OP_EQUALVERIFY.to_u8())?;
        reader.op(OP_HASH160.to_u8())?;
        let secret_hash = reader.push_hash()?;
        reader.op(OP_EQUALVERIFY.to_u8())?;
        reader.op(OP_DUP.to_u8())?;
        reader.op(OP_HASH160.to_u8())?;
        let redeemer_pkh = reader.push_hash()?;
        reader.op(OP_ELSE.to_u8())?;
        let lock_time = reader.push_int()?;
        let lock_time = u32::try_from(lock_time)
            .map_err(|_| ForeignError::invalid("lock time out of range"))?;
        reader.op(OP_CLTV.to_u8())?;
        reader.op(OP_DROP.to_u8())?;
        reader.op(OP_DUP.to_u8())?;
        reader.op(OP_HASH160.to_u8())?;
        let refunder_pkh = reader.push_hash()?;
        reader.op(OP_ENDIF.to_u8())?;
        reader.op(OP_EQUALVERIFY.to_u8())?;
        reader.op(OP_CHECKSIG.to_u8())?;
        reader.end()?;
        Ok(Self {
            refunder_pkh,
            redeemer_pkh,
            secret_hash,
            lock_time,
        })
    }

    pub fn p2sh_address(&self, network: Network) -> Result<Address> {
        Address::p2sh(&self.redeem_script(), network)
            .map_err(|error| ForeignError::Construction(error.to_string()))
    }
}

/// Strict cursor over script instructions.
struct ScriptReader<'a> {
    instructions: bitcoin::script::Instructions<'a>,
}

impl<'a> ScriptReader<'a> {
    fn new(script: &'a Script) -> Self {
        Self {
            instructions: script.instructions(),
        }
    }

    fn next(&mut self) -> Result<Instruction<'a>> {
        self.instructions
            .next()
            .ok_or_else(|| ForeignError::invalid("script ends early"))?
            .map_err(|error| ForeignError::invalid(format!("malformed script: {error}")))
    }

    fn op(&mut self, expected: u8) -> Result<()> {
        match self.next()? {
            Instruction::Op(op) if op.to_u8() == expected => Ok(()),
            _ => Err(ForeignError::invalid("unexpected script opcode")),
        }
    }

    fn push_bytes(&mut self) -> Result<&'a [u8]> {
        match self.next()? {
            Instruction::PushBytes(bytes) => Ok(bytes.as_bytes()),
            Instruction::Op(_) => Err(ForeignError::invalid("expected script push")),
        }
    }

    fn push_hash(&mut self) -> Result<[u8; 20]> {
        self.push_bytes()?
            .try_into()
            .map_err(|_| ForeignError::invalid("expected 20-byte hash push"))
    }

    /// Minimally-encoded script integer. Both pushes in the redeem
    /// script (secret length, lock time) exceed 16, so they are always
    /// raw byte pushes rather than `OP_PUSHNUM`s.
    fn push_int(&mut self) -> Result<i64> {
        let bytes = self.push_bytes()?;
        decode_script_int(bytes).ok_or_else(|| ForeignError::invalid("malformed script integer"))
    }

    fn end(mut self) -> Result<()> {
        if self.instructions.next().is_some() {
            return Err(ForeignError::invalid("trailing script bytes"));
        }
        Ok(())
    }
}

/// Little-endian, sign-magnitude, minimally encoded (Bitcoin CScriptNum).
fn decode_script_int(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let last = *bytes.last()?;
    // reject non-minimal encodings
    if last & 0x7f == 0 && (bytes.len() == 1 || bytes[bytes.len() - 2] & 0x80 == 0) {
        return None;
    }
    let mut value: i64 = 0;
    for (index, byte) in bytes.iter().enumerate() {
        let byte = if index == bytes.len() - 1 {
            byte & 0x7f
        } else {
            *byte
        };
        value |= i64::from(byte) << (8 * index);
    }
    Some(if last & 0x80 != 0 { -value } else { value })
}

/// scriptSig for the timeout branch: `<sig> <pubkey> OP_FALSE <script>`.
/// The public key feeds the `OP_DUP OP_HASH160` pair in the refund arm.
pub(crate) fn refund_script_sig(
    signature: &[u8],
    public_key: &[u8],
    redeem_script: &Script,
) -> Result<ScriptBuf> {
    let mut builder = Builder::new();
    builder = push_var(builder, signature)?;
    builder = push_var(builder, public_key)?;
    builder = builder.push_opcode(OP_FALSE);
    builder = push_var(builder, redeem_script.as_bytes())?;
    Ok(builder.into_script())
}

/// scriptSig for the secret branch:
/// `<sig> <pubkey> <secret> OP_TRUE <script>`.
pub(crate) fn redeem_script_sig(
    signature: &[u8],
    public_key: &[u8],
    secret: &[u8; SECRET_LENGTH],
    redeem_script: &Script,
) -> Result<ScriptBuf> {
    let mut builder = Builder::new();
    builder = push_var(builder, signature)?;
    builder = push_var(builder, public_key)?;
    builder = builder.push_slice(*secret);
    builder = builder.push_opcode(bitcoin::opcodes::OP_TRUE);
    builder = push_var(builder, redeem_script.as_bytes())?;
    Ok(builder.into_script())
}

fn push_var(builder: Builder, bytes: &[u8]) -> Result<Builder> {
    let buf = bitcoin::script::PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|_| ForeignError::Construction("oversized script push".into()))?;
    Ok(builder.push_slice(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn params() -> HtlcParams {
        HtlcParams {
            refunder_pkh: hex!("1111111111111111111111111111111111111111"),
            redeemer_pkh: hex!("2222222222222222222222222222222222222222"),
            secret_hash: hex!("d1b64100879ad93ceaa3c15929b6fe8550f54967"),
            lock_time: 1_585_920_000,
        }
    }

    #[test]
    fn script_bytes_are_canonical() {
        let script = params().redeem_script();
        let mut expected = Vec::new();
        expected.push(0x63); // OP_IF
        expected.push(0x82); // OP_SIZE
        expected.extend_from_slice(&[0x01, 0x20]); // push 32
        expected.push(0x88); // OP_EQUALVERIFY
        expected.push(0xa9); // OP_HASH160
        expected.push(0x14);
        expected.extend_from_slice(&params().secret_hash);
        expected.push(0x88);
        expected.push(0x76); // OP_DUP
        expected.push(0xa9);
        expected.push(0x14);
        expected.extend_from_slice(&params().redeemer_pkh);
        expected.push(0x67); // OP_ELSE
        expected.push(0x04); // push 4-byte lock time
        expected.extend_from_slice(&1_585_920_000u32.to_le_bytes());
        expected.push(0xb1); // OP_CHECKLOCKTIMEVERIFY
        expected.push(0x75); // OP_DROP
        expected.push(0x76);
        expected.push(0xa9);
        expected.push(0x14);
        expected.extend_from_slice(&params().refunder_pkh);
        expected.push(0x68); // OP_ENDIF
        expected.push(0x88);
        expected.push(0xac); // OP_CHECKSIG
        assert_eq!(script.as_bytes(), expected.as_slice());
    }

    #[test]
    fn parse_is_exact_inverse_of_build() {
        let original = params();
        let script = original.redeem_script();
        let parsed = HtlcParams::parse(&script).unwrap();
        assert_eq!(parsed, original);
        // round-trip through parse preserves the P2SH address
        assert_eq!(
            parsed.p2sh_address(Network::Testnet).unwrap(),
            original.p2sh_address(Network::Testnet).unwrap()
        );
    }

    #[test]
    fn parse_rejects_any_deviation() {
        let script = params().redeem_script();
        let mut bytes = script.to_bytes();
        bytes[0] = 0x64; // OP_NOTIF
        assert!(HtlcParams::parse(Script::from_bytes(&bytes)).is_err());

        let mut truncated = script.to_bytes();
        truncated.pop();
        assert!(HtlcParams::parse(Script::from_bytes(&truncated)).is_err());

        let mut trailing = script.to_bytes();
        trailing.push(0x51);
        assert!(HtlcParams::parse(Script::from_bytes(&trailing)).is_err());
    }

    #[test]
    fn p2sh_address_changes_with_every_field() {
        let base = params().p2sh_address(Network::Testnet).unwrap();
        let mutations: [fn(&mut HtlcParams); 4] = [
            |p| p.refunder_pkh[0] ^= 1,
            |p| p.redeemer_pkh[0] ^= 1,
            |p| p.secret_hash[0] ^= 1,
            |p| p.lock_time += 1,
        ];
        for mutate in mutations {
            let mut changed = params();
            mutate(&mut changed);
            assert_ne!(changed.p2sh_address(Network::Testnet).unwrap(), base);
        }
    }

    #[rstest::rstest]
    #[case::small(&[0x20], Some(32))]
    #[case::lock_time(&1_585_920_000u32.to_le_bytes(), Some(1_585_920_000))]
    #[case::negative(&[0x85], Some(-5))]
    #[case::non_minimal(&[0x20, 0x00], None)]
    #[case::empty(&[], None)]
    fn script_int_decoding(#[case] bytes: &[u8], #[case] expected: Option<i64>) {
        assert_eq!(decode_script_int(bytes), expected);
    }
}
