//! # Protocol Configuration & Constants
//!
//! Every magic number in the tap flow lives here: the APDU bytes both
//! phones must agree on, the Type 4 file layout, token precision, and the
//! settlement polling cadence. If a reader and a card disagree on one of
//! these, the tap silently fails, so change them in one place only.
//!
//! Runtime-tunable knobs are plain structs with a [`Default`] impl; the
//! binary overrides them from flags and environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// APDU Command Bytes
// ---------------------------------------------------------------------------

/// NDEF Tag Application identifier (NFC Forum Type 4, version 2.0).
pub const NDEF_APPLICATION_AID: [u8; 7] = [0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];

/// File identifier of the Capability Container.
pub const CC_FILE_ID: [u8; 2] = [0xE1, 0x03];

/// File identifier of the NDEF file that carries the payment request.
pub const NDEF_FILE_ID: [u8; 2] = [0xE1, 0x04];

/// SELECT-application: `00 A4 04 00 07 <AID> 00`.
pub const SELECT_APPLICATION_COMMAND: [u8; 13] = [
    0x00, 0xA4, 0x04, 0x00, 0x07, 0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01, 0x00,
];

/// SELECT-file by identifier, no response data: `00 A4 00 0C 02 E1 04`.
pub const SELECT_FILE_COMMAND: [u8; 7] = [0x00, 0xA4, 0x00, 0x0C, 0x02, 0xE1, 0x04];

/// READ-binary from offset zero for the maximum short length: `00 B0 00 00 FF`.
pub const READ_BINARY_COMMAND: [u8; 5] = [0x00, 0xB0, 0x00, 0x00, 0xFF];

/// Largest file the reader pulls in one READ-binary.
pub const MAX_FILE_SIZE: usize = 255;

// ---------------------------------------------------------------------------
// Settlement Polling
// ---------------------------------------------------------------------------

/// Time between two settlement poll cycles.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2_000);

/// Poll interval as milliseconds, for flag defaults.
/// Keep in sync with POLL_INTERVAL.
pub const POLL_INTERVAL_MS: u64 = 2_000;

/// Maximum number of signatures fetched per poll cycle.
pub const SIGNATURE_BATCH_SIZE: usize = 10;

/// Number of signatures fetched at poll start to seed the cursor.
pub const INITIAL_LOOKBACK_LIMIT: usize = 1;

/// Pause between two reader attempts after a failed or rejected tap.
pub const SCAN_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Commitment level used for every ledger query.
pub const DEFAULT_COMMITMENT: &str = "confirmed";

/// Upper bound on a single JSON-RPC round trip.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Token Precision
// ---------------------------------------------------------------------------

/// Lamports per SOL.
pub const SOL_DECIMALS: u32 = 9;

/// Base units per USDC.
pub const USDC_DECIMALS: u32 = 6;

/// USDC mint on mainnet-beta.
pub const USDC_MINT_MAINNET: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// USDC mint on devnet (Circle's faucet token).
pub const USDC_MINT_DEVNET: &str = "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU";

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// Ledger cluster the wallet talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cluster {
    /// Production network.
    Mainnet,
    /// Public development network. Default because taps are usually demos.
    #[default]
    Devnet,
    /// Public test network.
    Testnet,
    /// A validator running on this machine.
    Localnet,
}

impl Cluster {
    /// Default public JSON-RPC endpoint for the cluster.
    pub fn rpc_url(&self) -> &'static str {
        match self {
            Self::Mainnet => "https://api.mainnet-beta.solana.com",
            Self::Devnet => "https://api.devnet.solana.com",
            Self::Testnet => "https://api.testnet.solana.com",
            Self::Localnet => "http://127.0.0.1:8899",
        }
    }

    /// USDC mint address on this cluster. Testnet and localnet reuse the
    /// devnet mint since neither has a canonical deployment.
    pub fn usdc_mint(&self) -> &'static str {
        match self {
            Self::Mainnet => USDC_MINT_MAINNET,
            Self::Devnet | Self::Testnet | Self::Localnet => USDC_MINT_DEVNET,
        }
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Devnet => write!(f, "devnet"),
            Self::Testnet => write!(f, "testnet"),
            Self::Localnet => write!(f, "localnet"),
        }
    }
}

impl FromStr for Cluster {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "mainnet-beta" => Ok(Self::Mainnet),
            "devnet" => Ok(Self::Devnet),
            "testnet" => Ok(Self::Testnet),
            "localnet" | "localhost" => Ok(Self::Localnet),
            other => Err(format!("unknown cluster: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Settlement poller parameters.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between poll cycles.
    pub interval: Duration,
    /// Maximum signatures fetched per cycle.
    pub batch_size: usize,
    /// Signatures fetched at start to seed the cursor.
    pub initial_lookback: usize,
    /// Commitment level passed to every query.
    pub commitment: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
            batch_size: SIGNATURE_BATCH_SIZE,
            initial_lookback: INITIAL_LOOKBACK_LIMIT,
            commitment: DEFAULT_COMMITMENT.to_string(),
        }
    }
}

/// Reader-side continuous scan parameters.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Pause after a failed attempt before waiting for the next tap.
    pub retry_backoff: Duration,
    /// Give up after this many attempts. `None` scans until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            retry_backoff: SCAN_RETRY_BACKOFF,
            max_attempts: None,
        }
    }
}
