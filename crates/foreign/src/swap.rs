//! Refund and redeem flows for HTLC P2SH outputs.

use bitcoin::{
    Address, Amount, EcdsaSighashType, PrivateKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
    absolute::LockTime,
    address::{AddressData, NetworkUnchecked},
    consensus,
    hashes::{Hash, hash160},
    secp256k1::{Message, Secp256k1, SecretKey},
    sighash::SighashCache,
    transaction::Version,
};
use tracing::info;

use crate::{
    ForeignChain, ForeignError, Result, SECRET_LENGTH,
    htlc::{HtlcParams, redeem_script_sig, refund_script_sig},
    provider::{BlockchainProvider, ProviderError, Utxo},
};

/// How many recent headers median-time-past is computed over.
const MTP_HEADERS: usize = 11;
/// Timestamp offset inside a legacy header:
/// version (4) + previous hash (32) + merkle root (32).
const MTP_TIMESTAMP_OFFSET: usize = 68;

/// Everything the initiator needs to recover funds after timeout.
#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub p2sh_address: String,
    /// Raw private key material; see [`trim_private_key`].
    pub refund_private_key: Vec<u8>,
    /// The counterparty's P2PKH address.
    pub redeemer_address: String,
    pub secret_hash: [u8; 20],
    /// Seconds, compared against median-time-past.
    pub lock_time: u32,
    pub fee: Option<Amount>,
}

/// Everything the counterparty needs once it knows the secret.
#[derive(Debug, Clone)]
pub struct RedeemRequest {
    pub p2sh_address: String,
    pub redeem_private_key: Vec<u8>,
    /// The initiator's P2PKH address.
    pub refunder_address: String,
    pub secret: [u8; SECRET_LENGTH],
    pub lock_time: u32,
    pub fee: Option<Amount>,
}

/// A constructed (and possibly broadcast) HTLC spend.
///
/// The serialized bytes are always present, even when broadcasting
/// failed, so an aborted flow can be retried from the bytes alone.
#[derive(Debug)]
pub struct SwapOutcome {
    pub transaction: Transaction,
    pub raw: Vec<u8>,
    pub broadcast: Result<Txid, ProviderError>,
}

/// Keys arrive in several containers: raw 32 bytes, or Base58-decoded
/// WIF material of 37/38 bytes where a version byte leads and a checksum
/// (plus compression marker) trails. Trim down to the 32-byte secret.
pub fn trim_private_key(bytes: &[u8]) -> Result<[u8; 32]> {
    let trimmed: &[u8] = match bytes.len() {
        32 => bytes,
        37 | 38 => &bytes[1..33],
        _ => {
            return Err(ForeignError::invalid(format!(
                "private key must be 32 bytes (or 37/38 with envelope), got {}",
                bytes.len()
            )));
        }
    };
    Ok(trimmed.try_into().unwrap_or_else(|_| unreachable!()))
}

/// Median timestamp of the last 11 blocks, in seconds.
///
/// Headers must be the legacy 80-byte layout; the timestamp sits at byte
/// offset 68 as a little-endian u32. Timestamps are sorted descending
/// and the sixth (index 5) is the median.
pub fn median_time_past(provider: &dyn BlockchainProvider) -> Result<u64> {
    let headers = provider.block_headers(MTP_HEADERS)?;
    if headers.len() < MTP_HEADERS {
        return Err(ForeignError::safety(format!(
            "median-time-past needs {MTP_HEADERS} headers, got {}",
            headers.len()
        )));
    }
    let mut timestamps = Vec::with_capacity(MTP_HEADERS);
    for header in headers.iter().take(MTP_HEADERS) {
        if header.len() != 80 {
            return Err(ForeignError::safety(format!(
                "unexpected header length {}, wanted the legacy 80-byte format",
                header.len()
            )));
        }
        let bytes: [u8; 4] = header[MTP_TIMESTAMP_OFFSET..MTP_TIMESTAMP_OFFSET + 4]
            .try_into()
            .unwrap_or_else(|_| unreachable!());
        timestamps.push(u32::from_le_bytes(bytes));
    }
    timestamps.sort_unstable_by(|a, b| b.cmp(a));
    Ok(u64::from(timestamps[5]))
}

/// Recover an HTLC output through the timeout branch.
///
/// Recomputes the redeem script from the refunder's own key and the
/// advertised parameters, aborts on any P2SH mismatch, and refuses to
/// act before both the lock time and median-time-past have passed.
pub fn refund_htlc(
    chain: &ForeignChain,
    provider: &dyn BlockchainProvider,
    request: &RefundRequest,
    now_secs: u64,
) -> Result<SwapOutcome> {
    let secp = Secp256k1::new();
    let secret_key = SecretKey::from_slice(&trim_private_key(&request.refund_private_key)?)
        .map_err(|error| ForeignError::invalid(format!("refund key: {error}")))?;
    let private_key = PrivateKey::new(secret_key, chain.network);
    let public_key = private_key.public_key(&secp);

    let params = HtlcParams {
        refunder_pkh: public_key.pubkey_hash().to_byte_array(),
        redeemer_pkh: p2pkh_hash(chain, &request.redeemer_address, "redeemer address")?,
        secret_hash: request.secret_hash,
        lock_time: request.lock_time,
    };
    verify_p2sh(chain, &params, &request.p2sh_address)?;

    let mtp = median_time_past(provider)?;
    if now_secs < mtp {
        return Err(ForeignError::safety(format!(
            "refund blocked: now {now_secs} is before median-time-past {mtp}"
        )));
    }
    if now_secs < u64::from(request.lock_time) {
        return Err(ForeignError::safety(format!(
            "refund blocked: now {now_secs} is before lock time {}",
            request.lock_time
        )));
    }

    let p2sh = parse_address(chain, &request.p2sh_address, "P2SH address")?;
    let utxo = single_confirmed_utxo(provider, &p2sh)?;
    let fee = request.fee.unwrap_or(chain.p2sh_fee);
    let value = spendable_value(&utxo, fee)?;

    let mut tx = Transaction {
        version: Version::TWO,
        // CLTV requires the spending transaction to commit to the lock
        // time and leave the input sequence below the final value.
        lock_time: LockTime::from_consensus(request.lock_time),
        input: vec![TxIn {
            previous_output: utxo.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffff_fffe),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
        }],
    };

    let redeem_script = params.redeem_script();
    let signature = sign_input(&secp, &tx, &redeem_script, &secret_key)?;
    tx.input[0].script_sig =
        refund_script_sig(&signature, &public_key.to_bytes(), &redeem_script)?;

    finish(provider, tx)
}

/// Claim an HTLC output through the secret branch. No time constraint:
/// knowing the secret is the whole authorization.
pub fn redeem_htlc(
    chain: &ForeignChain,
    provider: &dyn BlockchainProvider,
    request: &RedeemRequest,
) -> Result<SwapOutcome> {
    let secp = Secp256k1::new();
    let secret_key = SecretKey::from_slice(&trim_private_key(&request.redeem_private_key)?)
        .map_err(|error| ForeignError::invalid(format!("redeem key: {error}")))?;
    let private_key = PrivateKey::new(secret_key, chain.network);
    let public_key = private_key.public_key(&secp);

    let params = HtlcParams {
        refunder_pkh: p2pkh_hash(chain, &request.refunder_address, "refunder address")?,
        redeemer_pkh: public_key.pubkey_hash().to_byte_array(),
        secret_hash: hash160::Hash::hash(&request.secret).to_byte_array(),
        lock_time: request.lock_time,
    };
    verify_p2sh(chain, &params, &request.p2sh_address)?;

    let p2sh = parse_address(chain, &request.p2sh_address, "P2SH address")?;
    let utxo = single_confirmed_utxo(provider, &p2sh)?;
    let fee = request.fee.unwrap_or(chain.p2sh_fee);
    let value = spendable_value(&utxo, fee)?;

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: utxo.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
        }],
    };

    let redeem_script = params.redeem_script();
    let signature = sign_input(&secp, &tx, &redeem_script, &secret_key)?;
    tx.input[0].script_sig = redeem_script_sig(
        &signature,
        &public_key.to_bytes(),
        &request.secret,
        &redeem_script,
    )?;

    finish(provider, tx)
}

fn parse_address(chain: &ForeignChain, address: &str, what: &str) -> Result<Address> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|error| ForeignError::invalid(format!("{what}: {error}")))?
        .require_network(chain.network)
        .map_err(|error| ForeignError::invalid(format!("{what}: {error}")))
}

fn p2pkh_hash(chain: &ForeignChain, address: &str, what: &str) -> Result<[u8; 20]> {
    match parse_address(chain, address, what)?.to_address_data() {
        AddressData::P2pkh { pubkey_hash } => Ok(pubkey_hash.to_byte_array()),
        _ => Err(ForeignError::invalid(format!("{what} must be P2PKH"))),
    }
}

/// The P2SH derived from our own view of the contract must equal the
/// advertised address; any mismatch means the parameters are wrong or
/// the counterparty lied, and the flow aborts.
fn verify_p2sh(chain: &ForeignChain, params: &HtlcParams, advertised: &str) -> Result<()> {
    let derived = params.p2sh_address(chain.network)?;
    let advertised = parse_address(chain, advertised, "P2SH address")?;
    if derived != advertised {
        return Err(ForeignError::safety(format!(
            "derived P2SH {derived} does not match advertised {advertised}"
        )));
    }
    Ok(())
}

fn single_confirmed_utxo(provider: &dyn BlockchainProvider, p2sh: &Address) -> Result<Utxo> {
    let confirmed: Vec<Utxo> = provider
        .address_utxos(p2sh)?
        .into_iter()
        .filter(|utxo| utxo.height.is_some())
        .collect();
    match confirmed.len() {
        1 => Ok(confirmed.into_iter().next().unwrap_or_else(|| unreachable!())),
        0 => Err(ForeignError::safety("no confirmed UTXO on the contract")),
        n => Err(ForeignError::safety(format!(
            "expected exactly one confirmed UTXO on the contract, found {n}"
        ))),
    }
}

fn spendable_value(utxo: &Utxo, fee: Amount) -> Result<Amount> {
    utxo.value
        .checked_sub(fee)
        .filter(|value| *value > Amount::ZERO)
        .ok_or_else(|| {
            ForeignError::safety(format!(
                "fee {fee} consumes the whole contract value {}",
                utxo.value
            ))
        })
}

fn sign_input(
    secp: &Secp256k1<bitcoin::secp256k1::All>,
    tx: &Transaction,
    redeem_script: &ScriptBuf,
    secret_key: &SecretKey,
) -> Result<Vec<u8>> {
    let sighash = SighashCache::new(tx)
        .legacy_signature_hash(0, redeem_script, EcdsaSighashType::All.to_u32())
        .map_err(|error| ForeignError::Construction(error.to_string()))?;
    let message = Message::from_digest(sighash.to_byte_array());
    let signature = bitcoin::ecdsa::Signature {
        signature: secp.sign_ecdsa(&message, secret_key),
        sighash_type: EcdsaSighashType::All,
    };
    Ok(signature.to_vec())
}

/// Serialize and broadcast. Broadcast failure is not an error at this
/// level: the bytes are part of the outcome so callers can retry.
fn finish(provider: &dyn BlockchainProvider, tx: Transaction) -> Result<SwapOutcome> {
    let raw = consensus::encode::serialize(&tx);
    let broadcast = provider.broadcast(&tx);
    match &broadcast {
        Ok(txid) => info!(%txid, "HTLC spend broadcast"),
        Err(error) => info!(%error, "HTLC spend constructed but broadcast failed"),
    }
    Ok(SwapOutcome {
        transaction: tx,
        raw,
        broadcast,
    })
}
