//! # Role Flows
//!
//! The two halves of a tap, each as one cancellable call.
//!
//! ```text
//!   ReceiveFlow                              SendFlow
//!   ───────────                              ────────
//!   validate + encode request
//!   seed ledger cursor
//!   arm HCE session ───── NFC ─────────────► continuous scan
//!   await read latch                         accept policy (token support)
//!   poll ledger ◄──────── ledger ─────────── submit transfer
//!   SettlementResult                         (request, signature)
//! ```
//!
//! Both take a `watch::Receiver<bool>` and return [`TapError::Cancelled`]
//! once it flips. `ReceiveFlow` switches the virtual card off on every exit
//! path.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::apdu::{ContinuousScanner, ScanNotice, TagReader};
use crate::config::{Cluster, PollerConfig, ScanConfig};
use crate::error::{ProtocolError, TapError};
use crate::hce::{CardEmulator, HceSession};
use crate::request::{PaymentRequest, Token};
use crate::settlement::poller::cancelled;
use crate::settlement::{
    LedgerClient, SettlementPoller, SettlementResult, TransferSigner, TransferSubmitter,
    WatchTarget,
};

// ---------------------------------------------------------------------------
// Receive
// ---------------------------------------------------------------------------

/// Card side: publish a request, then wait for the money.
pub struct ReceiveFlow<E: CardEmulator, L: LedgerClient> {
    session: Arc<HceSession<E>>,
    ledger: Arc<L>,
    cluster: Cluster,
    poller: PollerConfig,
}

impl<E: CardEmulator, L: LedgerClient + 'static> ReceiveFlow<E, L> {
    /// Wires a flow over an existing session and ledger client.
    pub fn new(
        session: Arc<HceSession<E>>,
        ledger: Arc<L>,
        cluster: Cluster,
        poller: PollerConfig,
    ) -> Self {
        Self {
            session,
            ledger,
            cluster,
            poller,
        }
    }

    /// The session this flow arms.
    pub fn session(&self) -> &Arc<HceSession<E>> {
        &self.session
    }

    /// Pins the ledger cursor, arms the card with `request`, waits for a
    /// reader to pull it, then polls until the matching transfer shows up.
    ///
    /// The cursor is taken before the card is armed, so a transfer the
    /// payer submits right after reading is always newer than it.
    pub async fn run(
        &self,
        request: &PaymentRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SettlementResult, TapError> {
        request.validate()?;

        let target = WatchTarget::for_cluster(request.address.clone(), request.token, self.cluster);
        let mut poller =
            SettlementPoller::new(Arc::clone(&self.ledger), target, self.poller.clone());
        let seeded = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(TapError::Cancelled),
            seeded = poller.seed() => seeded,
        };
        if let Err(e) = seeded {
            warn!(error = %e, "cursor seed failed, poller will retry");
        }

        let handle = self.session.arm_request(request)?;
        let _card = DisableOnDrop(&self.session);

        info!(
            token = %request.token,
            amount = %request.amount,
            address = %request.address,
            cursor = ?poller.cursor().last_seen,
            "waiting for reader"
        );
        let read = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            read = handle.read() => Some(read),
        };
        match read {
            None => return Err(TapError::Cancelled),
            Some(None) => {
                return Err(ProtocolError::Rejected("session re-armed before read".into()).into())
            }
            Some(Some(event)) => info!(generation = event.generation, "request read, polling"),
        }

        poller.run(cancel).await.ok_or(TapError::Cancelled)
    }
}

struct DisableOnDrop<'a, E: CardEmulator>(&'a HceSession<E>);

impl<E: CardEmulator> Drop for DisableOnDrop<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = self.0.disable() {
            warn!(error = %e, "could not switch card emulation off");
        }
    }
}

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

/// A request read off a tap and paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPayment {
    /// What was asked for.
    pub request: PaymentRequest,
    /// Signature of the submitted transfer.
    pub signature: String,
}

/// Reader side: read a request, pay it.
pub struct SendFlow<R: TagReader, S: TransferSubmitter> {
    scanner: ContinuousScanner<R>,
    submitter: Arc<S>,
    signer: Arc<dyn TransferSigner>,
}

impl<R: TagReader, S: TransferSubmitter> SendFlow<R, S> {
    /// Builds a flow that only accepts requests in `supported` tokens.
    pub fn new(
        reader: R,
        submitter: Arc<S>,
        signer: Arc<dyn TransferSigner>,
        config: ScanConfig,
        supported: &[Token],
    ) -> Self {
        let supported = supported.to_vec();
        let scanner = ContinuousScanner::new(reader, config).with_policy(move |request| {
            if supported.contains(&request.token) {
                Ok(())
            } else {
                Err(ProtocolError::Rejected(format!(
                    "{} is not supported by this wallet",
                    request.token
                )))
            }
        });
        Self {
            scanner,
            submitter,
            signer,
        }
    }

    /// Per-attempt failure notices, for toasts.
    pub fn notices(&self) -> broadcast::Receiver<ScanNotice> {
        self.scanner.subscribe()
    }

    /// Scans until a supported request is read, then submits the transfer.
    pub async fn run(&mut self, mut cancel: watch::Receiver<bool>) -> Result<SentPayment, TapError> {
        let request = self.scanner.run(cancel.clone()).await?;
        let amount = request.base_units()?;

        if *cancel.borrow_and_update() {
            return Err(TapError::Cancelled);
        }

        let signature = self
            .submitter
            .submit_transfer(self.signer.as_ref(), &request.address, request.token, amount)
            .await?;
        info!(%signature, mode = %request.mode, "payment sent");
        Ok(SentPayment { request, signature })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerQueryError;
    use crate::hce::{InProcessEmulator, LoopbackReader, SessionState};
    use crate::request::EncodedPayload;
    use crate::settlement::{SignatureInfo, SignatureQuery, TransactionDetail, TransferIntent};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::time::Duration;

    struct StubSigner;

    impl TransferSigner for StubSigner {
        fn payer(&self) -> String {
            "Addr2".into()
        }

        fn sign_transfer(&self, intent: &TransferIntent) -> Result<Vec<u8>, LedgerQueryError> {
            Ok(intent.amount.to_le_bytes().to_vec())
        }
    }

    #[derive(Default)]
    struct RecordingSubmitter {
        submitted: Mutex<Vec<(String, Token, u64)>>,
    }

    #[async_trait]
    impl TransferSubmitter for RecordingSubmitter {
        async fn submit_transfer(
            &self,
            signer: &dyn TransferSigner,
            destination: &str,
            token: Token,
            amount: u64,
        ) -> Result<String, LedgerQueryError> {
            assert_eq!(signer.payer(), "Addr2");
            self.submitted
                .lock()
                .push((destination.to_string(), token, amount));
            Ok("sig-1".into())
        }
    }

    struct EmptyLedger;

    #[async_trait]
    impl LedgerClient for EmptyLedger {
        async fn recent_signatures(
            &self,
            _query: SignatureQuery<'_>,
        ) -> Result<Vec<SignatureInfo>, LedgerQueryError> {
            Ok(Vec::new())
        }

        async fn transaction_detail(
            &self,
            _signature: &str,
            _commitment: &str,
        ) -> Result<Option<TransactionDetail>, LedgerQueryError> {
            Ok(None)
        }
    }

    fn request(token: Token) -> PaymentRequest {
        PaymentRequest::new(token, Decimal::new(15, 1), "Addr1").unwrap()
    }

    #[tokio::test]
    async fn send_flow_pays_read_request() {
        let session = Arc::new(HceSession::new(InProcessEmulator));
        session.arm_request(&request(Token::SOL)).unwrap();
        let submitter = Arc::new(RecordingSubmitter::default());
        let mut flow = SendFlow::new(
            LoopbackReader::new(Arc::clone(&session)),
            Arc::clone(&submitter),
            Arc::new(StubSigner),
            ScanConfig::default(),
            &Token::ALL,
        );
        let (_tx, rx) = watch::channel(false);

        let sent = flow.run(rx).await.unwrap();

        assert_eq!(sent.request, request(Token::SOL));
        assert_eq!(sent.signature, "sig-1");
        assert_eq!(
            submitter.submitted.lock().clone(),
            vec![("Addr1".to_string(), Token::SOL, 1_500_000_000)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_flow_rejects_unsupported_token_and_keeps_scanning() {
        let session = Arc::new(HceSession::new(InProcessEmulator));
        session.arm_request(&request(Token::USDC)).unwrap();
        let submitter = Arc::new(RecordingSubmitter::default());
        let mut flow = SendFlow::new(
            LoopbackReader::new(Arc::clone(&session)),
            Arc::clone(&submitter),
            Arc::new(StubSigner),
            ScanConfig {
                retry_backoff: Duration::from_millis(10),
                max_attempts: Some(2),
            },
            &[Token::SOL],
        );
        let mut notices = flow.notices();
        let (_tx, rx) = watch::channel(false);

        let err = flow.run(rx).await.unwrap_err();

        assert!(matches!(err, TapError::Protocol(ProtocolError::Rejected(_))));
        assert!(notices.recv().await.unwrap().message.contains("USDC"));
        assert!(submitter.submitted.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_flow_rearms_on_unpayable_amount() {
        // 1e-7 USDC is finer than a base unit; a valid encoder never emits it.
        let mut file = vec![0x00, 0x38, 0xD1, 0x01, 0x34, b'T', 0x02, b'e', b'n'];
        file.extend_from_slice(br#"{"token":"USDC","amount":1e-7,"address":"Addr1"}"#);
        let session = Arc::new(HceSession::new(InProcessEmulator));
        session.arm(EncodedPayload::from(file)).unwrap();
        let submitter = Arc::new(RecordingSubmitter::default());
        let mut flow = SendFlow::new(
            LoopbackReader::new(Arc::clone(&session)),
            Arc::clone(&submitter),
            Arc::new(StubSigner),
            ScanConfig {
                retry_backoff: Duration::from_millis(10),
                max_attempts: Some(2),
            },
            &Token::ALL,
        );
        let mut notices = flow.notices();
        let (_tx, rx) = watch::channel(false);

        let err = flow.run(rx).await.unwrap_err();

        assert!(matches!(err, TapError::Protocol(ProtocolError::InvalidPayload(_))));
        for attempt in 1..=2 {
            let notice = notices.recv().await.unwrap();
            assert_eq!(notice.attempt, attempt);
            assert!(notice.protocol_failure);
        }
        assert!(submitter.submitted.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_flow_cancel_disables_card() {
        let session = Arc::new(HceSession::new(InProcessEmulator));
        let flow = ReceiveFlow::new(
            Arc::clone(&session),
            Arc::new(EmptyLedger),
            Cluster::Devnet,
            PollerConfig::default(),
        );
        let (tx, rx) = watch::channel(false);
        let request = request(Token::SOL);

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(session.is_enabled());
            let _ = tx.send(true);
        };
        let (result, ()) = tokio::join!(flow.run(&request, rx), canceller);

        assert!(matches!(result, Err(TapError::Cancelled)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_enabled());
    }

    #[tokio::test]
    async fn receive_flow_rejects_invalid_request() {
        let session = Arc::new(HceSession::new(InProcessEmulator));
        let flow = ReceiveFlow::new(
            Arc::clone(&session),
            Arc::new(EmptyLedger),
            Cluster::Devnet,
            PollerConfig::default(),
        );
        let bad = PaymentRequest {
            amount: Decimal::ZERO,
            ..request(Token::SOL)
        };
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            flow.run(&bad, rx).await,
            Err(TapError::Protocol(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }
}
