use std::collections::HashSet;

use bitcoin::{
    Address, Amount, EcdsaSighashType, PrivateKey, PublicKey, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
    absolute::LockTime,
    bip32::{ChildNumber, Xpriv},
    hashes::Hash,
    script::{Builder, PushBytesBuf},
    secp256k1::{All, Message, Secp256k1},
    sighash::SighashCache,
    transaction::Version,
};
use tracing::debug;

use crate::{
    ForeignChain, ForeignError, Result,
    provider::{BlockchainProvider, Utxo},
};

pub const LOOKAHEAD_START: u32 = 3;
pub const LOOKAHEAD_INCREMENT: u32 = 3;

/// Outputs below this are burned into fees rather than returned as change.
const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Rough legacy-transaction weight: per-input and per-output byte costs
/// plus a fixed envelope.
const BYTES_PER_INPUT: u64 = 148;
const BYTES_PER_OUTPUT: u64 = 34;
const BYTES_OVERHEAD: u64 = 10;

/// An unspent output together with the key-chain leaf that controls it.
#[derive(Debug, Clone)]
pub struct WalletUtxo {
    pub utxo: Utxo,
    pub key_index: u32,
}

/// Walker over the BIP32 receive chain `m/0/i`.
///
/// Tracks leaf keys known to have historical activity but no current
/// UTXOs (`spent_keys`, treated as permanently used) and a lookahead
/// window that starts at [`LOOKAHEAD_START`] and widens by
/// [`LOOKAHEAD_INCREMENT`] whenever a batch ends without reaching the
/// walk's goal. Both are private to this wallet instance.
pub struct KeyChainWallet<'a, P: BlockchainProvider + ?Sized> {
    chain: &'a ForeignChain,
    provider: &'a P,
    secp: Secp256k1<All>,
    spent_keys: HashSet<[u8; 20]>,
    lookahead: u32,
}

struct Leaf {
    private_key: PrivateKey,
    public_key: PublicKey,
    address: Address,
    pkh: [u8; 20],
}

impl<'a, P: BlockchainProvider + ?Sized> KeyChainWallet<'a, P> {
    pub fn new(chain: &'a ForeignChain, provider: &'a P) -> Self {
        Self {
            chain,
            provider,
            secp: Secp256k1::new(),
            spent_keys: HashSet::new(),
            lookahead: LOOKAHEAD_START,
        }
    }

    pub const fn lookahead(&self) -> u32 {
        self.lookahead
    }

    pub fn spent_key_count(&self) -> usize {
        self.spent_keys.len()
    }

    fn leaf(&self, xprv: &Xpriv, index: u32) -> Result<Leaf> {
        let path = [
            ChildNumber::from_normal_idx(0)
                .map_err(|error| ForeignError::invalid(error.to_string()))?,
            ChildNumber::from_normal_idx(index)
                .map_err(|error| ForeignError::invalid(error.to_string()))?,
        ];
        let derived = xprv
            .derive_priv(&self.secp, &path)
            .map_err(|error| ForeignError::invalid(error.to_string()))?;
        let private_key = derived.to_priv();
        let public_key = private_key.public_key(&self.secp);
        let address = Address::p2pkh(&public_key, self.chain.network);
        let pkh = public_key.pubkey_hash().to_byte_array();
        Ok(Leaf {
            private_key,
            public_key,
            address,
            pkh,
        })
    }

    /// First never-used receive address.
    ///
    /// Keys with UTXOs are live, keys in `spent_keys` are skipped, keys
    /// with history but no UTXOs join `spent_keys`; the first key with
    /// neither history nor UTXOs is the answer.
    pub fn unused_receive_address(&mut self, xprv: &Xpriv) -> Result<Address> {
        let mut index = 0;
        loop {
            while index < self.lookahead {
                let leaf = self.leaf(xprv, index)?;
                let utxos = self.provider.address_utxos(&leaf.address)?;
                if !utxos.is_empty() {
                    self.spent_keys.remove(&leaf.pkh);
                } else if !self.spent_keys.contains(&leaf.pkh) {
                    let history = self.provider.address_history(&leaf.address)?;
                    if history.is_empty() {
                        return Ok(leaf.address);
                    }
                    self.spent_keys.insert(leaf.pkh);
                }
                index += 1;
            }
            self.lookahead += LOOKAHEAD_INCREMENT;
        }
    }

    /// All spendable outputs across the discovered key chain, ending at
    /// the first never-used key.
    pub fn utxos(&mut self, xprv: &Xpriv) -> Result<Vec<WalletUtxo>> {
        let mut collected = Vec::new();
        let mut index = 0;
        'walk: loop {
            while index < self.lookahead {
                let leaf = self.leaf(xprv, index)?;
                let utxos = self.provider.address_utxos(&leaf.address)?;
                if utxos.is_empty() {
                    if !self.spent_keys.contains(&leaf.pkh) {
                        let history = self.provider.address_history(&leaf.address)?;
                        if history.is_empty() {
                            break 'walk;
                        }
                        self.spent_keys.insert(leaf.pkh);
                    }
                } else {
                    self.spent_keys.remove(&leaf.pkh);
                    collected.extend(utxos.into_iter().map(|utxo| WalletUtxo {
                        utxo,
                        key_index: index,
                    }));
                }
                index += 1;
            }
            self.lookahead += LOOKAHEAD_INCREMENT;
        }
        Ok(collected)
    }

    pub fn balance(&mut self, xprv: &Xpriv) -> Result<Amount> {
        Ok(self
            .utxos(xprv)?
            .iter()
            .fold(Amount::ZERO, |sum, entry| sum + entry.utxo.value))
    }

    /// Build and sign a legacy P2PKH spend of `amount` to `recipient`.
    ///
    /// `None` means insufficient funds. This is the only place the
    /// wallet signs anything.
    pub fn build_spend(
        &mut self,
        xprv: &Xpriv,
        recipient: &Address,
        amount: Amount,
        fee_per_byte: Option<Amount>,
    ) -> Result<Option<Transaction>> {
        let fee_per_byte = fee_per_byte.unwrap_or_else(|| self.chain.fee_per_byte());
        let available = self.utxos(xprv)?;

        let mut selected: Vec<WalletUtxo> = Vec::new();
        let mut total = Amount::ZERO;
        let mut fee = Amount::ZERO;
        let mut funded = false;
        for entry in available {
            total = total + entry.utxo.value;
            selected.push(entry);
            fee = estimate_fee(selected.len(), 2, fee_per_byte);
            if total >= amount + fee {
                funded = true;
                break;
            }
        }
        if !funded {
            debug!(%amount, %total, "insufficient funds for spend");
            return Ok(None);
        }

        // change goes back to the first selected key's own address
        let change_leaf = self.leaf(xprv, selected[0].key_index)?;
        let mut outputs = vec![TxOut {
            value: amount,
            script_pubkey: recipient.script_pubkey(),
        }];
        let change = total - amount - fee;
        if change >= DUST_LIMIT {
            outputs.push(TxOut {
                value: change,
                script_pubkey: change_leaf.address.script_pubkey(),
            });
        }

        let mut tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: selected
                .iter()
                .map(|entry| TxIn {
                    previous_output: entry.utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        };

        let mut script_sigs = Vec::with_capacity(selected.len());
        for (input_index, entry) in selected.iter().enumerate() {
            let leaf = self.leaf(xprv, entry.key_index)?;
            let script_pubkey = leaf.address.script_pubkey();
            let sighash = SighashCache::new(&tx)
                .legacy_signature_hash(
                    input_index,
                    &script_pubkey,
                    EcdsaSighashType::All.to_u32(),
                )
                .map_err(|error| ForeignError::Construction(error.to_string()))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = bitcoin::ecdsa::Signature {
                signature: self.secp.sign_ecdsa(&message, &leaf.private_key.inner),
                sighash_type: EcdsaSighashType::All,
            };
            let signature_push = PushBytesBuf::try_from(signature.to_vec())
                .map_err(|_| ForeignError::Construction("oversized signature".into()))?;
            let key_push = PushBytesBuf::try_from(leaf.public_key.to_bytes())
                .map_err(|_| ForeignError::Construction("oversized public key".into()))?;
            script_sigs.push(
                Builder::new()
                    .push_slice(signature_push)
                    .push_slice(key_push)
                    .into_script(),
            );
        }
        for (input, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
        Ok(Some(tx))
    }
}

fn estimate_fee(inputs: usize, outputs: usize, fee_per_byte: Amount) -> Amount {
    let bytes =
        BYTES_OVERHEAD + BYTES_PER_INPUT * inputs as u64 + BYTES_PER_OUTPUT * outputs as u64;
    fee_per_byte * bytes
}
