//! Standalone refund/redeem tools for HTLC atomic swaps.
//!
//! Exit codes: 0 success, 1 usage error, 2 runtime or safety failure
//! (wrong P2SH, too early, missing UTXO, provider trouble).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::Amount;
use clap::{Parser, Subcommand};
use quarry_foreign::{
    EsploraProvider, ForeignError, RedeemRequest, RefundRequest, Settings, SwapOutcome,
    redeem_htlc, refund_htlc,
};
use tracing::debug;

#[derive(Parser)]
#[command(name = "quarry-swap", version, about = "HTLC refund/redeem tools")]
struct Cli {
    /// Settings file (JSON: network, provider_url, fee_per_kb)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover an HTLC through the timeout branch
    Refund {
        /// The contract's P2SH address
        p2sh_address: String,
        /// Refund private key, hex or Base58
        refund_key: String,
        /// Counterparty's P2PKH address
        redeemer_address: String,
        /// HASH160 of the swap secret, 20 bytes of hex
        secret_hash: String,
        /// Lock time in seconds
        lock_time: u32,
        /// Fee override in satoshis
        fee: Option<u64>,
    },
    /// Claim an HTLC with the revealed secret
    Redeem {
        /// The contract's P2SH address
        p2sh_address: String,
        /// Redeem private key, hex or Base58
        redeem_key: String,
        /// Counterparty's P2PKH address
        refunder_address: String,
        /// The 32-byte swap secret, hex
        secret: String,
        /// Lock time in seconds
        lock_time: u32,
        /// Fee override in satoshis
        fee: Option<u64>,
    },
}

const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_RUNTIME: u8 = 2;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    ExitCode::from(run())
}

fn run() -> u8 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return EXIT_USAGE;
        }
    };

    let settings = match cli.settings.as_deref().map_or_else(
        || Ok(Settings::default()),
        Settings::load,
    ) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("{error}");
            return EXIT_USAGE;
        }
    };
    let chain = settings.chain();
    debug!(network = chain.name, url = %settings.provider_url, "configured");

    let provider = match EsploraProvider::new(&settings.provider_url) {
        Ok(provider) => provider,
        Err(error) => {
            eprintln!("{error}");
            return EXIT_RUNTIME;
        }
    };

    let outcome = match cli.command {
        Command::Refund {
            p2sh_address,
            refund_key,
            redeemer_address,
            secret_hash,
            lock_time,
            fee,
        } => {
            let request = match build_refund_request(
                p2sh_address,
                &refund_key,
                redeemer_address,
                &secret_hash,
                lock_time,
                fee,
            ) {
                Ok(request) => request,
                Err(message) => {
                    eprintln!("{message}");
                    return EXIT_USAGE;
                }
            };
            refund_htlc(&chain, &provider, &request, now_seconds())
        }
        Command::Redeem {
            p2sh_address,
            redeem_key,
            refunder_address,
            secret,
            lock_time,
            fee,
        } => {
            let request = match build_redeem_request(
                p2sh_address,
                &redeem_key,
                refunder_address,
                &secret,
                lock_time,
                fee,
            ) {
                Ok(request) => request,
                Err(message) => {
                    eprintln!("{message}");
                    return EXIT_USAGE;
                }
            };
            redeem_htlc(&chain, &provider, &request)
        }
    };

    match outcome {
        Ok(outcome) => report(&outcome),
        Err(error @ ForeignError::InvalidInput(_)) => {
            eprintln!("{error}");
            EXIT_USAGE
        }
        Err(error) => {
            eprintln!("{error}");
            EXIT_RUNTIME
        }
    }
}

fn report(outcome: &SwapOutcome) -> u8 {
    // the bytes are printed even when broadcasting failed, so the spend
    // can be retried from them
    println!("{}", hex::encode(&outcome.raw));
    match &outcome.broadcast {
        Ok(txid) => {
            println!("{txid}");
            EXIT_OK
        }
        Err(error) => {
            eprintln!("broadcast failed: {error}");
            EXIT_RUNTIME
        }
    }
}

fn build_refund_request(
    p2sh_address: String,
    refund_key: &str,
    redeemer_address: String,
    secret_hash: &str,
    lock_time: u32,
    fee: Option<u64>,
) -> Result<RefundRequest, String> {
    Ok(RefundRequest {
        p2sh_address,
        refund_private_key: decode_key_material(refund_key)?,
        redeemer_address,
        secret_hash: decode_fixed_hex(secret_hash, "secret hash")?,
        lock_time,
        fee: fee.map(Amount::from_sat),
    })
}

fn build_redeem_request(
    p2sh_address: String,
    redeem_key: &str,
    refunder_address: String,
    secret: &str,
    lock_time: u32,
    fee: Option<u64>,
) -> Result<RedeemRequest, String> {
    Ok(RedeemRequest {
        p2sh_address,
        redeem_private_key: decode_key_material(redeem_key)?,
        refunder_address,
        secret: decode_fixed_hex(secret, "secret")?,
        lock_time,
        fee: fee.map(Amount::from_sat),
    })
}

/// Private keys arrive as hex or Base58; either way the raw bytes go to
/// the library, which trims WIF-style envelopes itself.
fn decode_key_material(input: &str) -> Result<Vec<u8>, String> {
    if let Ok(bytes) = hex::decode(input) {
        return Ok(bytes);
    }
    bs58::decode(input)
        .into_vec()
        .map_err(|_| "private key is neither hex nor Base58".to_owned())
}

fn decode_fixed_hex<const N: usize>(input: &str, what: &str) -> Result<[u8; N], String> {
    let bytes = hex::decode(input).map_err(|_| format!("{what} must be hex"))?;
    bytes
        .try_into()
        .map_err(|_| format!("{what} must be {N} bytes"))
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
