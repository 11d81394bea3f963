//! # CLI Interface
//!
//! Command-line structure for `tappay` using `clap` derive. Subcommands:
//! `request`, `decode`, `simulate`, `watch`, and `version`.

use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;

use tappay_protocol::config::Cluster;
use tappay_protocol::{PaymentMode, Token};

use crate::logging::LogFormat;

/// TapPay command-line harness.
///
/// Builds and inspects tap payloads, runs a full card/reader exchange in
/// process, and watches an address for the transfer that settles a tap.
#[derive(Parser, Debug)]
#[command(
    name = "tappay",
    about = "TapPay NFC payment tooling",
    version,
    propagate_version = true
)]
pub struct TapPayCli {
    /// Log output format on stderr.
    #[arg(
        long,
        global = true,
        env = "TAPPAY_LOG_FORMAT",
        value_enum,
        ignore_case = true,
        default_value_t = LogFormat::Pretty
    )]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Encode a payment request and print the files the card would serve.
    Request(RequestArgs),
    /// Decode a hex dump of a READ response into a payment request.
    Decode(DecodeArgs),
    /// Arm an in-process card and read it back through the APDU exchange.
    Simulate(RequestArgs),
    /// Poll the ledger until a transfer to the address settles.
    Watch(WatchArgs),
    /// Print version information and exit.
    Version,
}

/// The request a receiver would publish.
#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Token to request: SOL or USDC.
    #[arg(long, short = 't', default_value = "SOL")]
    pub token: Token,

    /// Amount in whole tokens, e.g. 1.5.
    #[arg(long, short = 'a')]
    pub amount: Decimal,

    /// Receiving address (base58).
    #[arg(long)]
    pub address: String,

    /// Settlement mode: wallet or program.
    #[arg(long, default_value = "wallet")]
    pub mode: PaymentMode,
}

/// Arguments for the `decode` subcommand.
#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Hex-encoded bytes as returned by the card, status word optional.
    pub hex: String,
}

/// Arguments for the `watch` subcommand.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Address to watch for incoming transfers.
    #[arg(long)]
    pub address: String,

    /// Token to expect: SOL or USDC.
    #[arg(long, short = 't', default_value = "SOL")]
    pub token: Token,

    /// Ledger cluster. Picks the RPC endpoint and USDC mint.
    #[arg(long, env = "TAPPAY_CLUSTER", default_value = "devnet")]
    pub cluster: Cluster,

    /// JSON-RPC endpoint. Overrides the cluster's public endpoint.
    #[arg(long, env = "TAPPAY_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Milliseconds between poll cycles.
    #[arg(long, default_value_t = tappay_protocol::config::POLL_INTERVAL_MS)]
    pub interval_ms: u64,

    /// Commitment level for ledger queries.
    #[arg(long, default_value = tappay_protocol::config::DEFAULT_COMMITMENT)]
    pub commitment: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        TapPayCli::command().debug_assert();
    }

    #[test]
    fn parses_request_arguments() {
        let cli = TapPayCli::parse_from([
            "tappay", "request", "--token", "USDC", "--amount", "2.25", "--address", "Addr1",
        ]);
        match cli.command {
            Commands::Request(args) => {
                assert_eq!(args.token, Token::USDC);
                assert_eq!(args.amount, Decimal::new(225, 2));
                assert_eq!(args.mode, PaymentMode::Wallet);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.log_format, LogFormat::Pretty);
    }

    #[test]
    fn log_format_is_global() {
        let cli = TapPayCli::parse_from(["tappay", "version", "--log-format", "JSON"]);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
