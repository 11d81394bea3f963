//! # Continuous Scan
//!
//! The paying phone keeps its reader armed until a valid request is read or
//! the screen goes away. Each tap is one attempt:
//!
//! ```text
//!        ┌──────┐  target in field  ┌────────────┐   decoded + accepted  ┌─────────┐
//!  ────► │ Idle │ ────────────────► │ Exchanging │ ────────────────────► │ Success │
//!        └──────┘                   └────────────┘                       └─────────┘
//!           ▲                             │ any failure
//!           │      backoff elapsed   ┌────▼──┐
//!           └────────────────────────┤ Retry │
//!                                    └───────┘
//! ```
//!
//! Exactly one exchange is in flight at a time and its target is released
//! before the next attempt starts. Every failure, including a request the
//! caller declines, is reported as a [`ScanNotice`] and re-arms the reader.
//!
//! Cancellation is cooperative: the loop watches a `tokio::sync::watch`
//! channel at every suspension point and returns [`TapError::Cancelled`]
//! once it flips to `true` (or its sender is dropped).

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::error::{ProtocolError, TapError, TransportError};
use crate::request::PaymentRequest;

use super::dispatcher::{read_payment_request, ApduTarget, TargetGuard};

/// Capacity of the notice channel. Notices are advisory; slow subscribers
/// simply miss old ones.
const NOTICE_CHANNEL_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Reader abstraction
// ---------------------------------------------------------------------------

/// The phone's NFC reader in IsoDep mode.
#[async_trait]
pub trait TagReader: Send {
    /// Handle to a connected target.
    type Target: ApduTarget + 'static;

    /// Suspends until a target enters the field and returns exclusive
    /// access to it.
    async fn wait_for_target(&mut self) -> Result<Self::Target, TransportError>;
}

/// Caller-level acceptance check run on every decoded request.
pub type AcceptPolicy = Box<dyn Fn(&PaymentRequest) -> Result<(), ProtocolError> + Send + Sync>;

// ---------------------------------------------------------------------------
// State & notices
// ---------------------------------------------------------------------------

/// Where the scanner currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    /// Waiting for a target.
    Idle,
    /// An exchange is in flight.
    Exchanging {
        /// 1-based attempt counter.
        attempt: u32,
    },
    /// The last attempt failed; backing off before re-arming.
    Retry {
        /// Attempt that failed.
        attempt: u32,
    },
    /// A request was read and accepted.
    Success,
    /// The scan was cancelled.
    Cancelled,
}

/// Transient, user-facing report of a failed attempt.
#[derive(Debug, Clone)]
pub struct ScanNotice {
    /// Attempt that failed.
    pub attempt: u32,
    /// Short message suitable for a toast.
    pub message: String,
    /// Whether the request itself was bad (as opposed to the link).
    pub protocol_failure: bool,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Drives the reader until a request is read, accepted, and returned.
pub struct ContinuousScanner<R: TagReader> {
    reader: R,
    config: ScanConfig,
    accept: AcceptPolicy,
    notices: broadcast::Sender<ScanNotice>,
    state: ScanState,
}

impl<R: TagReader> ContinuousScanner<R> {
    /// Creates a scanner that accepts every well-formed request.
    pub fn new(reader: R, config: ScanConfig) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            reader,
            config,
            accept: Box::new(|_| Ok(())),
            notices,
            state: ScanState::Idle,
        }
    }

    /// Installs a caller-level acceptance check. A rejection is surfaced as
    /// a notice and the reader re-arms.
    pub fn with_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&PaymentRequest) -> Result<(), ProtocolError> + Send + Sync + 'static,
    {
        self.accept = Box::new(policy);
        self
    }

    /// Subscribes to failure notices.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanNotice> {
        self.notices.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> &ScanState {
        &self.state
    }

    /// Returns the reader, e.g. to close it after scanning.
    pub fn into_reader(self) -> R {
        self.reader
    }

    /// Runs attempts until one yields an accepted request, the attempt
    /// budget runs out, or `shutdown` fires.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PaymentRequest, TapError> {
        info!("continuous scan started");
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Err(self.cancel());
            }

            attempt += 1;
            self.state = ScanState::Exchanging { attempt };

            let outcome = tokio::select! {
                outcome = Self::attempt(&mut self.reader, &self.accept) => Some(outcome),
                _ = shutdown.changed() => None,
            };
            let Some(outcome) = outcome else {
                return Err(self.cancel());
            };

            let err = match outcome {
                Ok(request) => {
                    self.state = ScanState::Success;
                    info!(attempt, token = %request.token, amount = %request.amount, "payment request read");
                    return Ok(request);
                }
                Err(err) => err,
            };

            self.state = ScanState::Retry { attempt };
            warn!(attempt, error = %err, "scan attempt failed, re-arming");
            let _ = self.notices.send(ScanNotice {
                attempt,
                message: user_message(&err),
                protocol_failure: matches!(err, TapError::Protocol(_)),
            });

            if let Some(max) = self.config.max_attempts {
                if attempt >= max {
                    self.state = ScanState::Idle;
                    return Err(err);
                }
            }

            let backoff = self.config.retry_backoff;
            let resumed = tokio::select! {
                _ = tokio::time::sleep(backoff) => true,
                _ = shutdown.changed() => false,
            };
            if !resumed {
                return Err(self.cancel());
            }
            self.state = ScanState::Idle;
        }
    }

    /// One tap: connect, exchange, decode, check policy. The target is
    /// released when the guard drops, whichever way this returns.
    async fn attempt(reader: &mut R, accept: &AcceptPolicy) -> Result<PaymentRequest, TapError> {
        let target = reader.wait_for_target().await?;
        let mut guard = TargetGuard::new(target);
        debug!("target connected");
        let request = read_payment_request(guard.target()).await?;
        accept(&request)?;
        Ok(request)
    }

    fn cancel(&mut self) -> TapError {
        info!("continuous scan cancelled");
        self.state = ScanState::Cancelled;
        TapError::Cancelled
    }
}

/// Message shown to the user for a failed attempt.
fn user_message(err: &TapError) -> String {
    match err {
        TapError::Protocol(ProtocolError::FileSelectRejected { .. }) => {
            "Failed to communicate with NFC tag (File)".to_string()
        }
        TapError::Protocol(ProtocolError::UnsupportedToken(_)) => "Invalid token type.".to_string(),
        TapError::Protocol(ProtocolError::MissingField(_)) => {
            "Invalid address or amount.".to_string()
        }
        TapError::Protocol(ProtocolError::Rejected(reason)) => reason.clone(),
        TapError::Protocol(_) => "Could not read the payment request.".to_string(),
        TapError::Transport(_) => "Connection lost, tap again.".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::dispatcher::tests::{ok, read_response, ScriptedTarget};
    use crate::request::Token;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Hands out pre-scripted targets, one per tap, then blocks forever.
    struct QueueReader {
        targets: VecDeque<ScriptedTarget>,
        releases: Arc<AtomicUsize>,
    }

    impl QueueReader {
        fn new(scripts: Vec<Vec<Result<Vec<u8>, TransportError>>>) -> Self {
            let releases = Arc::new(AtomicUsize::new(0));
            let targets = scripts
                .into_iter()
                .map(|script| {
                    let mut target = ScriptedTarget::new(script);
                    target.releases = Arc::clone(&releases);
                    target
                })
                .collect();
            Self { targets, releases }
        }
    }

    #[async_trait]
    impl TagReader for QueueReader {
        type Target = ScriptedTarget;

        async fn wait_for_target(&mut self) -> Result<ScriptedTarget, TransportError> {
            match self.targets.pop_front() {
                Some(target) => Ok(target),
                None => std::future::pending().await,
            }
        }
    }

    fn fast() -> ScanConfig {
        ScanConfig {
            retry_backoff: Duration::from_millis(1),
            max_attempts: None,
        }
    }

    const GOOD: &str = r#"{"token":"SOL","amount":1.5,"address":"Addr1"}"#;

    #[tokio::test]
    async fn retries_after_failures_and_releases_every_target() {
        let reader = QueueReader::new(vec![
            vec![ok(), Ok(vec![0x6A, 0x82])],
            vec![ok(), ok(), read_response(r#"{"token":"ETH","amount":1,"address":"A"}"#)],
            vec![ok(), Err(TransportError::TargetLost)],
            vec![ok(), ok(), read_response(GOOD)],
        ]);
        let releases = Arc::clone(&reader.releases);
        let mut scanner = ContinuousScanner::new(reader, fast());
        let mut notices = scanner.subscribe();
        let (_tx, rx) = watch::channel(false);

        let request = scanner.run(rx).await.unwrap();

        assert_eq!(request.token, Token::SOL);
        assert_eq!(scanner.state(), &ScanState::Success);
        assert_eq!(releases.load(Ordering::SeqCst), 4);

        let first = notices.recv().await.unwrap();
        assert_eq!(first.attempt, 1);
        assert!(first.message.contains("File"));
        let second = notices.recv().await.unwrap();
        assert_eq!(second.message, "Invalid token type.");
        let third = notices.recv().await.unwrap();
        assert!(!third.protocol_failure);
    }

    #[tokio::test]
    async fn policy_rejection_rearms() {
        let reader = QueueReader::new(vec![
            vec![ok(), ok(), read_response(r#"{"token":"USDC","amount":1,"address":"Addr1"}"#)],
            vec![ok(), ok(), read_response(GOOD)],
        ]);
        let mut scanner = ContinuousScanner::new(reader, fast()).with_policy(|request| {
            if request.token == Token::SOL {
                Ok(())
            } else {
                Err(ProtocolError::Rejected(format!("{} not supported", request.token)))
            }
        });
        let mut notices = scanner.subscribe();
        let (_tx, rx) = watch::channel(false);

        let request = scanner.run(rx).await.unwrap();

        assert_eq!(request.token, Token::SOL);
        assert_eq!(notices.recv().await.unwrap().message, "USDC not supported");
    }

    #[tokio::test]
    async fn cancellation_while_waiting_exits_cleanly() {
        let reader = QueueReader::new(vec![]);
        let mut scanner = ContinuousScanner::new(reader, fast());
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let err = scanner.run(rx).await.unwrap_err();
        assert!(matches!(err, TapError::Cancelled));
        assert_eq!(scanner.state(), &ScanState::Cancelled);
    }

    #[tokio::test]
    async fn already_cancelled_never_touches_reader() {
        let reader = QueueReader::new(vec![vec![ok(), ok(), read_response(GOOD)]]);
        let mut scanner = ContinuousScanner::new(reader, fast());
        let (_tx, rx) = watch::channel(true);

        assert!(matches!(scanner.run(rx).await, Err(TapError::Cancelled)));
        assert_eq!(scanner.into_reader().targets.len(), 1);
    }

    #[tokio::test]
    async fn attempt_budget_is_honoured() {
        let reader = QueueReader::new(vec![
            vec![ok(), Ok(vec![0x6A, 0x82])],
            vec![ok(), Ok(vec![0x6A, 0x82])],
            vec![ok(), ok(), read_response(GOOD)],
        ]);
        let config = ScanConfig {
            max_attempts: Some(2),
            ..fast()
        };
        let mut scanner = ContinuousScanner::new(reader, config);
        let (_tx, rx) = watch::channel(false);

        let err = scanner.run(rx).await.unwrap_err();
        assert!(matches!(
            err,
            TapError::Protocol(ProtocolError::FileSelectRejected { .. })
        ));
    }
}
