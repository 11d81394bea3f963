// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # TapPay CLI
//!
//! Entry point for the `tappay` binary. Parses arguments, initializes
//! logging, and runs one subcommand:
//!
//! - `request`  — encode a request, print the NDEF and CC files as hex
//! - `decode`   — decode a captured READ response
//! - `simulate` — card and reader in one process, full APDU exchange
//! - `watch`    — poll the ledger until a transfer settles
//! - `version`  — print build version information
//!
//! Results are printed to stdout as JSON.

mod cli;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::signal;
use tokio::sync::watch;

use tappay_protocol::apdu::ContinuousScanner;
use tappay_protocol::config::{PollerConfig, ScanConfig, MAX_FILE_SIZE};
use tappay_protocol::hce::{HceSession, InProcessEmulator, LoopbackReader, TagImage};
use tappay_protocol::request::{decode, encode};
use tappay_protocol::rpc::RpcLedgerClient;
use tappay_protocol::settlement::{SettlementPoller, WatchTarget};
use tappay_protocol::PaymentRequest;

use cli::{Commands, TapPayCli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TapPayCli::parse();
    logging::init_logging(cli.log_format);

    match cli.command {
        Commands::Request(args) => print_request(args),
        Commands::Decode(args) => decode_capture(args),
        Commands::Simulate(args) => simulate_tap(args).await,
        Commands::Watch(args) => watch_address(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn build_request(args: cli::RequestArgs) -> Result<PaymentRequest> {
    let request = PaymentRequest::new(args.token, args.amount, args.address)
        .context("invalid payment request")?
        .with_mode(args.mode);
    Ok(request)
}

/// Prints the two files a card armed with this request would serve.
fn print_request(args: cli::RequestArgs) -> Result<()> {
    let request = build_request(args)?;
    let payload = encode(&request).context("failed to encode request")?;
    let image = TagImage::new(payload.clone());

    let out = json!({
        "request": request,
        "ndef_file": payload.to_hex(),
        "ndef_len": payload.len(),
        "max_file_size": MAX_FILE_SIZE,
        "capability_container": hex::encode(image.capability_container()),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Decodes a hex capture of a READ response.
fn decode_capture(args: cli::DecodeArgs) -> Result<()> {
    let cleaned: String = args.hex.split_whitespace().collect();
    let bytes = hex::decode(&cleaned).context("input is not valid hex")?;
    let request = decode(&bytes).context("capture does not hold a payment request")?;
    println!("{}", serde_json::to_string_pretty(&request)?);
    Ok(())
}

/// Arms an in-process card and reads it back through the reader path.
async fn simulate_tap(args: cli::RequestArgs) -> Result<()> {
    let request = build_request(args)?;

    let session = Arc::new(HceSession::new(InProcessEmulator));
    session.on_read(|event| {
        tracing::info!(
            generation = event.generation,
            bytes = event.payload_len,
            "card reports payload read"
        );
    });
    let handle = session
        .arm_request(&request)
        .context("failed to arm card emulation")?;

    let mut scanner = ContinuousScanner::new(
        LoopbackReader::new(Arc::clone(&session)),
        ScanConfig {
            max_attempts: Some(1),
            ..ScanConfig::default()
        },
    );
    let (_stop, stop_rx) = watch::channel(false);
    let received = scanner.run(stop_rx).await.context("reader failed")?;
    let read = handle.read().await;
    session.disable().context("failed to disable card emulation")?;

    if received != request {
        bail!("reader decoded {} but card served {}", received, request);
    }

    let out = json!({
        "request": received,
        "read_generation": read.map(|r| r.generation),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Polls until a transfer to the address is attributed, or Ctrl+C.
async fn watch_address(args: cli::WatchArgs) -> Result<()> {
    let url = args
        .rpc_url
        .clone()
        .unwrap_or_else(|| args.cluster.rpc_url().to_string());
    let client = RpcLedgerClient::new(url.as_str())
        .context("failed to build RPC client")?
        .with_commitment(args.commitment.as_str());

    tracing::info!(
        rpc_url = %url,
        cluster = %args.cluster,
        address = %args.address,
        token = %args.token,
        "watching for settlement"
    );

    let target = WatchTarget::for_cluster(args.address, args.token, args.cluster);
    let config = PollerConfig {
        interval: Duration::from_millis(args.interval_ms),
        commitment: args.commitment,
        ..PollerConfig::default()
    };
    let poller = SettlementPoller::new(Arc::new(client), target, config);

    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let name = shutdown_signal().await;
        tracing::info!(signal = name, "stopping watch");
        let _ = stop.send(true);
    });

    match poller.run(stop_rx).await {
        Some(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        None => {
            tracing::info!("stopped before a transfer arrived");
            Ok(())
        }
    }
}

/// Prints version information to stdout.
fn print_version() {
    println!("tappay   {}", env!("CARGO_PKG_VERSION"));
    println!("rustc    {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Resolves when the operator stops `tappay watch`: Ctrl+C anywhere, or
/// SIGTERM on Unix. Returns the signal's name for the log. A handler that
/// cannot be installed is logged and never fires.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                tracing::warn!(error = %e, "Ctrl+C will not stop the watch");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM will not stop the watch");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}
