//! # Settlement Poller
//!
//! After the payer's phone has read the request, the receiving phone has no
//! direct channel back. It learns that the money arrived by watching its own
//! address on the ledger:
//!
//! 1. **Seed** -- fetch the newest signature (lookback 1) and remember it as
//!    the cursor, so only activity *after* the tap counts.
//! 2. **Tick** -- every [`PollerConfig::interval`], list up to
//!    [`PollerConfig::batch_size`] signatures newer than the cursor and walk
//!    them oldest-first.
//! 3. **Attribute** -- for each successful transaction, diff the target's
//!    balance and pick the first other account that was debited as the
//!    counterparty (see [`super::attribution`]).
//! 4. **Stop** -- the first attributed receipt is the result; the poller
//!    ends. If a whole batch yields nothing, the cursor moves to the newest
//!    signature of the batch and polling continues.
//!
//! ## Cycles and cancellation
//!
//! One tokio task owns the poller, so cycles never overlap and the cursor is
//! only ever advanced by the cycle that read it. A tick that comes due while
//! a slow cycle is still running is skipped, not queued.
//!
//! The task watches a `tokio::sync::watch` channel. When it flips to `true`
//! (or the sender is dropped) the in-flight cycle is abandoned at its next
//! await point and no further ledger calls are made.
//!
//! ## Failures
//!
//! A [`LedgerQueryError`] anywhere in a cycle is logged and the cycle is
//! skipped. The cursor stays put and the next tick retries.

use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{Cluster, PollerConfig};
use crate::error::LedgerQueryError;
use crate::request::Token;

use super::attribution::{self, Receipt};
use super::ledger::{LedgerClient, SignatureQuery, TransactionDetail};

// ---------------------------------------------------------------------------
// Result & target
// ---------------------------------------------------------------------------

/// An incoming transfer attributed to a sender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    /// Amount received in whole tokens.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// Token received.
    pub token: Token,
    /// Best-guess sender.
    pub counterparty: String,
    /// Signature of the transaction that carried the transfer.
    pub reference: String,
}

/// What the poller is watching for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchTarget {
    /// Receiving wallet.
    pub address: String,
    /// Token expected.
    pub token: Token,
    /// SPL mint to follow; `None` for native SOL.
    pub mint: Option<String>,
}

impl WatchTarget {
    /// Watches native SOL arriving at `address`.
    pub fn native(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: Token::SOL,
            mint: None,
        }
    }

    /// Watches `token` arriving at `address`, using the cluster's mint for
    /// SPL tokens.
    pub fn for_cluster(address: impl Into<String>, token: Token, cluster: Cluster) -> Self {
        let mint = match token {
            Token::SOL => None,
            Token::USDC => Some(cluster.usdc_mint().to_string()),
        };
        Self {
            address: address.into(),
            token,
            mint,
        }
    }

    fn receipt(&self, detail: &TransactionDetail) -> Option<Receipt> {
        let changes = match &self.mint {
            None => attribution::native_changes(detail)?,
            Some(mint) => attribution::token_changes(detail, mint),
        };
        attribution::attribute(&changes, &self.address)
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// How far back the poller has already looked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementCursor {
    /// Address whose history is walked.
    pub target_address: String,
    /// Newest signature already examined. `None` after seeding an address
    /// with no history.
    pub last_seen: Option<String>,
    seeded: bool,
}

impl SettlementCursor {
    fn new(target_address: String) -> Self {
        Self {
            target_address,
            last_seen: None,
            seeded: false,
        }
    }

    /// Whether the starting point has been fetched.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Watches one address for one incoming transfer.
pub struct SettlementPoller<L: LedgerClient> {
    ledger: Arc<L>,
    target: WatchTarget,
    config: PollerConfig,
    cursor: SettlementCursor,
    seen: HashSet<String>,
}

impl<L: LedgerClient + 'static> SettlementPoller<L> {
    /// Creates an unseeded poller.
    pub fn new(ledger: Arc<L>, target: WatchTarget, config: PollerConfig) -> Self {
        let cursor = SettlementCursor::new(target.address.clone());
        Self {
            ledger,
            target,
            config,
            cursor,
            seen: HashSet::new(),
        }
    }

    /// Current cursor.
    pub fn cursor(&self) -> &SettlementCursor {
        &self.cursor
    }

    /// Spawns the poll loop on the current runtime.
    pub fn start(self) -> PollerHandle {
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(self.run(cancelled));
        PollerHandle { cancel, task }
    }

    /// Seeds the cursor unless [`seed`](Self::seed) already has, then polls
    /// until a receipt is found or `cancel` fires. Returns `None` when
    /// cancelled.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> Option<SettlementResult> {
        info!(
            address = %self.target.address,
            token = %self.target.token,
            interval_ms = self.config.interval.as_millis() as u64,
            "settlement poller starting"
        );

        if !self.cursor.seeded {
            let seeded = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => None,
                seeded = self.seed() => Some(seeded),
            };
            match seeded {
                None => return self.stopped(),
                Some(Err(e)) => warn!(error = %e, "cursor seed failed, retrying next tick"),
                Some(Ok(())) => {}
            }
        }

        let period = self.config.interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return self.stopped(),
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => None,
                outcome = self.cycle() => Some(outcome),
            };
            let Some(outcome) = outcome else {
                return self.stopped();
            };

            match outcome {
                Ok(Some(result)) => {
                    info!(
                        reference = %result.reference,
                        amount = %result.amount,
                        token = %result.token,
                        counterparty = %result.counterparty,
                        "settlement detected"
                    );
                    return Some(result);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "poll cycle failed, skipping"),
            }
        }
    }

    /// Fetches the newest signature and makes it the cursor.
    pub async fn seed(&mut self) -> Result<(), LedgerQueryError> {
        let newest = self
            .ledger
            .recent_signatures(SignatureQuery {
                address: &self.target.address,
                limit: self.config.initial_lookback,
                until: None,
                commitment: &self.config.commitment,
            })
            .await?;

        self.cursor.last_seen = newest.first().map(|s| s.signature.clone());
        self.cursor.seeded = true;
        debug!(cursor = ?self.cursor.last_seen, "cursor seeded");
        Ok(())
    }

    /// Runs one poll cycle. Seeds instead if an earlier seed failed.
    pub async fn cycle(&mut self) -> Result<Option<SettlementResult>, LedgerQueryError> {
        if !self.cursor.seeded {
            self.seed().await?;
            return Ok(None);
        }

        let batch = self
            .ledger
            .recent_signatures(SignatureQuery {
                address: &self.target.address,
                limit: self.config.batch_size,
                until: self.cursor.last_seen.as_deref(),
                commitment: &self.config.commitment,
            })
            .await?;

        let Some(newest) = batch.first().map(|s| s.signature.clone()) else {
            debug!("no new signatures");
            return Ok(None);
        };
        debug!(count = batch.len(), "new signatures");

        // The ledger lists newest first.
        for info in batch.iter().rev() {
            if self.seen.contains(&info.signature) {
                continue;
            }
            if info.failed {
                debug!(signature = %info.signature, "skipping failed transaction");
                self.seen.insert(info.signature.clone());
                continue;
            }

            let detail = self
                .ledger
                .transaction_detail(&info.signature, &self.config.commitment)
                .await?;
            self.seen.insert(info.signature.clone());

            let Some(detail) = detail else {
                debug!(signature = %info.signature, "transaction not available");
                continue;
            };
            if detail.failed {
                continue;
            }

            if let Some(receipt) = self.target.receipt(&detail) {
                return Ok(Some(SettlementResult {
                    amount: self.target.token.from_base_units(receipt.amount),
                    token: self.target.token,
                    counterparty: receipt.counterparty,
                    reference: info.signature.clone(),
                }));
            }
        }

        self.cursor.last_seen = Some(newest);
        Ok(None)
    }

    fn stopped(&self) -> Option<SettlementResult> {
        info!(address = %self.target.address, "settlement poller cancelled");
        None
    }
}

/// Resolves once cancellation is requested or the sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owner-side view of a running poller.
pub struct PollerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<Option<SettlementResult>>,
}

impl PollerHandle {
    /// Stops the poller. Safe to call more than once and after it has
    /// already finished.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit. `None` if it was cancelled.
    pub async fn result(self) -> Option<SettlementResult> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "settlement poller task failed");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
