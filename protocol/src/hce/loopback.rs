//! In-process link between a reader and an emulated card.
//!
//! [`LoopbackTarget`] hands every command straight to
//! [`HceSession::process_apdu`], so the full reader exchange can run
//! against a real session without NFC hardware. Used by the `simulate`
//! command and the end-to-end tests.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::apdu::{ApduTarget, TagReader};
use crate::error::TransportError;

use super::session::{CardEmulator, HceSession};

/// A connected "tag" that is really an [`HceSession`] in this process.
pub struct LoopbackTarget<E: CardEmulator> {
    session: Arc<HceSession<E>>,
    released: bool,
}

impl<E: CardEmulator> LoopbackTarget<E> {
    /// Connects to `session`.
    pub fn new(session: Arc<HceSession<E>>) -> Self {
        Self {
            session,
            released: false,
        }
    }
}

#[async_trait]
impl<E: CardEmulator + 'static> ApduTarget for LoopbackTarget<E> {
    async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.released {
            return Err(TransportError::TargetLost);
        }
        let response = self.session.process_apdu(command);
        debug!(
            command = %hex::encode(command),
            response = %hex::encode(&response),
            "loopback apdu"
        );
        Ok(response)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.session.link_lost();
        }
    }
}

/// Reader that "detects" the local session on every wait, as long as the
/// card is switched on.
pub struct LoopbackReader<E: CardEmulator> {
    session: Arc<HceSession<E>>,
}

impl<E: CardEmulator> LoopbackReader<E> {
    /// Points the reader at `session`.
    pub fn new(session: Arc<HceSession<E>>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl<E: CardEmulator + 'static> TagReader for LoopbackReader<E> {
    type Target = LoopbackTarget<E>;

    async fn wait_for_target(&mut self) -> Result<Self::Target, TransportError> {
        if !self.session.is_enabled() {
            return Err(TransportError::ReaderUnavailable(
                "no card in the field".to_string(),
            ));
        }
        Ok(LoopbackTarget::new(Arc::clone(&self.session)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::{read_payment_request, TargetGuard};
    use crate::hce::session::{InProcessEmulator, SessionState};
    use crate::request::{PaymentRequest, Token};
    use rust_decimal::Decimal;

    fn armed_session() -> (Arc<HceSession<InProcessEmulator>>, PaymentRequest) {
        let session = Arc::new(HceSession::new(InProcessEmulator));
        let request = PaymentRequest::new(Token::USDC, Decimal::new(25, 1), "Addr1").unwrap();
        session.arm_request(&request).unwrap();
        (session, request)
    }

    #[tokio::test]
    async fn reader_exchange_against_session() {
        let (session, request) = armed_session();
        let mut reader = LoopbackReader::new(Arc::clone(&session));

        let target = reader.wait_for_target().await.unwrap();
        let mut guard = TargetGuard::new(target);
        let received = read_payment_request(guard.target()).await.unwrap();

        assert_eq!(received, request);
        assert!(matches!(
            session.state(),
            SessionState::Armed { read: true, .. }
        ));
    }

    #[tokio::test]
    async fn released_target_is_lost() {
        let (session, _) = armed_session();
        let mut target = LoopbackTarget::new(session);
        target.release();
        target.release();
        assert_eq!(
            target.transceive(&[0x00, 0xA4, 0x04, 0x00]).await,
            Err(TransportError::TargetLost)
        );
    }

    #[tokio::test]
    async fn disabled_card_is_not_detected() {
        let (session, _) = armed_session();
        session.disable().unwrap();
        let mut reader = LoopbackReader::new(session);
        assert!(matches!(
            reader.wait_for_target().await,
            Err(TransportError::ReaderUnavailable(_))
        ));
    }
}
