//! Esplora-style HTTP provider.

use core::str::FromStr;
use core::time::Duration;

use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Transaction, Txid, consensus};
use serde::Deserialize;
use tracing::debug;

use crate::provider::{BlockchainProvider, ProviderError, Utxo};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct UtxoDto {
    txid: String,
    vout: u32,
    value: u64,
    status: StatusDto,
}

#[derive(Debug, Deserialize)]
struct StatusDto {
    confirmed: bool,
    block_height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct HistoryDto {
    txid: String,
}

/// Blocking client against an Esplora REST endpoint. Retries transient
/// transport failures internally; callers only ever see the final error.
#[derive(Debug)]
pub struct EsploraProvider {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl EsploraProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn get_text(&self, path: &str) -> Result<String, ProviderError> {
        let url = format!("{}/{path}", self.base_url);
        let mut last_error = None;
        for attempt in 1..=ATTEMPTS {
            match self.try_get(&url) {
                Ok(body) => return Ok(body),
                Err(error) => {
                    debug!(%url, attempt, %error, "esplora request failed");
                    last_error = Some(error);
                    if attempt < ATTEMPTS {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ProviderError::Transport("unreachable".into())))
    }

    fn try_get(&self, url: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::Transport(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }
        response
            .text()
            .map_err(|error| ProviderError::Transport(error.to_string()))
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let body = self.get_text(path)?;
        serde_json::from_str(&body).map_err(|error| ProviderError::Malformed(error.to_string()))
    }

    fn header_by_hash(&self, hash: &str) -> Result<Vec<u8>, ProviderError> {
        let hex_header = self.get_text(&format!("block/{hash}/header"))?;
        let bytes = hex::decode(hex_header.trim())
            .map_err(|error| ProviderError::Malformed(error.to_string()))?;
        if bytes.len() != 80 {
            return Err(ProviderError::Malformed(format!(
                "header is {} bytes, expected 80",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Big-endian display hash of the previous block, from header bytes
    /// 4..36 (little-endian on the wire).
    fn previous_block_hash(header: &[u8]) -> String {
        let mut prev: Vec<u8> = header[4..36].to_vec();
        prev.reverse();
        hex::encode(prev)
    }
}

impl BlockchainProvider for EsploraProvider {
    fn height(&self) -> Result<u32, ProviderError> {
        let body = self.get_text("blocks/tip/height")?;
        body.trim()
            .parse()
            .map_err(|_| ProviderError::Malformed(format!("bad tip height: {body}")))
    }

    fn block_headers(&self, count: usize) -> Result<Vec<Vec<u8>>, ProviderError> {
        let mut hash = self.get_text("blocks/tip/hash")?.trim().to_owned();
        let mut headers = Vec::with_capacity(count);
        while headers.len() < count {
            let header = self.header_by_hash(&hash)?;
            let previous = Self::previous_block_hash(&header);
            headers.push(header);
            // the genesis header has an all-zero previous hash
            if previous.chars().all(|c| c == '0') {
                break;
            }
            hash = previous;
        }
        Ok(headers)
    }

    fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ProviderError> {
        let rows: Vec<UtxoDto> = self.get_json(&format!("address/{address}/utxo"))?;
        let mut utxos = Vec::with_capacity(rows.len());
        for row in rows {
            let txid = Txid::from_str(&row.txid)
                .map_err(|error| ProviderError::Malformed(error.to_string()))?;
            // resolve the script through the funding transaction
            let script_pubkey = self
                .transaction(&txid)?
                .and_then(|tx| {
                    tx.output
                        .get(row.vout as usize)
                        .map(|out| out.script_pubkey.clone())
                })
                .unwrap_or_else(ScriptBuf::new);
            utxos.push(Utxo {
                outpoint: OutPoint::new(txid, row.vout),
                value: Amount::from_sat(row.value),
                height: row.status.confirmed.then_some(row.status.block_height).flatten(),
                script_pubkey,
            });
        }
        Ok(utxos)
    }

    fn address_history(&self, address: &Address) -> Result<Vec<Txid>, ProviderError> {
        let rows: Vec<HistoryDto> = self.get_json(&format!("address/{address}/txs"))?;
        rows.iter()
            .map(|row| {
                Txid::from_str(&row.txid)
                    .map_err(|error| ProviderError::Malformed(error.to_string()))
            })
            .collect()
    }

    fn transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ProviderError> {
        let body = match self.get_text(&format!("tx/{txid}/hex")) {
            Ok(body) => body,
            Err(ProviderError::Transport(message)) if message.contains("HTTP 404") => {
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        let bytes = hex::decode(body.trim())
            .map_err(|error| ProviderError::Malformed(error.to_string()))?;
        consensus::encode::deserialize(&bytes)
            .map(Some)
            .map_err(|error| ProviderError::Malformed(error.to_string()))
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ProviderError> {
        let url = format!("{}/tx", self.base_url);
        let raw = hex::encode(consensus::encode::serialize(tx));
        let response = self
            .client
            .post(&url)
            .body(raw)
            .send()
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        if !status.is_success() {
            return Err(ProviderError::Rejected(body));
        }
        Txid::from_str(body.trim()).map_err(|error| ProviderError::Malformed(error.to_string()))
    }
}
