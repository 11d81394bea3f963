//! # Card Emulation Session
//!
//! The receiving phone publishes its payment request by pretending to be a
//! read-only Type 4 tag. An [`HceSession`] owns that virtual card for one
//! screen's lifetime:
//!
//! ```text
//!   Idle ──arm(payload)──► Armed ──reader reads NDEF──► Armed (latch tripped)
//!    ▲                       │                              │
//!    └──────disable()────────┴──────────disable()───────────┘
//! ```
//!
//! Every `arm` installs a fresh tag and a fresh one-shot latch. The latch is
//! an atomic compare-and-swap, so two read events racing each other fire
//! the handler exactly once; arming again resets it.
//!
//! Platform failures ([`EmulationError`]) are returned to the caller and
//! logged. They never tear the session down, and the caller is free to arm
//! again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::apdu::{ApduResponse, StatusWord};
use crate::error::{EmulationError, ProtocolError, TapError};
use crate::request::{self, EncodedPayload, PaymentRequest};

use super::tag::{LinkState, TagImage};

// ---------------------------------------------------------------------------
// Platform seam
// ---------------------------------------------------------------------------

/// The platform's host card emulation service.
///
/// Implementations forward to whatever the OS exposes; both calls may fail
/// without affecting the session state kept here.
pub trait CardEmulator: Send + Sync {
    /// Installs `tag` as the application served to readers.
    fn install(&self, tag: &TagImage) -> Result<(), EmulationError>;

    /// Turns the virtual card on or off.
    fn set_enabled(&self, enabled: bool) -> Result<(), EmulationError>;
}

/// Emulator with no platform behind it. APDUs are delivered through
/// [`HceSession::process_apdu`] directly, as the loopback reader does.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessEmulator;

impl CardEmulator for InProcessEmulator {
    fn install(&self, _tag: &TagImage) -> Result<(), EmulationError> {
        Ok(())
    }

    fn set_enabled(&self, _enabled: bool) -> Result<(), EmulationError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Read notification
// ---------------------------------------------------------------------------

/// Emitted once per arm when a reader has pulled the whole payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadRead {
    /// Arm generation the read belongs to.
    pub generation: u64,
    /// Size of the NDEF file that was read.
    pub payload_len: usize,
}

/// Callback invoked on the first completed read of each arm.
pub type ReadHandler = Arc<dyn Fn(PayloadRead) + Send + Sync>;

/// Returned by [`HceSession::arm`].
#[derive(Debug)]
pub struct SessionHandle {
    generation: u64,
    read: oneshot::Receiver<PayloadRead>,
}

impl SessionHandle {
    /// Arm generation this handle tracks.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Waits for the payload to be read.
    ///
    /// Resolves to `None` if the session is disabled or re-armed first.
    pub async fn read(self) -> Option<PayloadRead> {
        self.read.await.ok()
    }
}

/// Lifecycle of the virtual card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No payload installed, card off.
    Idle,
    /// Serving a payload; `read` tells whether the latch has tripped.
    Armed {
        /// Arm generation.
        generation: u64,
        /// Whether the payload has been read.
        read: bool,
    },
}

// ---------------------------------------------------------------------------
// HceSession
// ---------------------------------------------------------------------------

struct Armed {
    generation: u64,
    tag: TagImage,
    link: LinkState,
    latch: Arc<AtomicBool>,
    notify: Option<oneshot::Sender<PayloadRead>>,
}

#[derive(Default)]
struct Inner {
    armed: Option<Armed>,
    enabled: bool,
    generation: u64,
    handler: Option<ReadHandler>,
}

/// One virtual-card session.
pub struct HceSession<E: CardEmulator> {
    emulator: E,
    inner: Mutex<Inner>,
}

impl<E: CardEmulator> HceSession<E> {
    /// Creates an idle session on top of `emulator`.
    pub fn new(emulator: E) -> Self {
        Self {
            emulator,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Encodes `request` and arms the card with it.
    pub fn arm_request(&self, request: &PaymentRequest) -> Result<SessionHandle, ArmError> {
        let payload = request::encode(request)?;
        Ok(self.arm(payload)?)
    }

    /// Installs `payload` and enables the card.
    ///
    /// Replaces whatever was armed before; the previous handle resolves to
    /// `None`. On failure the session is left idle.
    pub fn arm(&self, payload: EncodedPayload) -> Result<SessionHandle, EmulationError> {
        let tag = TagImage::new(payload);
        let mut inner = self.inner.lock();

        inner.generation += 1;
        let generation = inner.generation;
        inner.armed = None;

        if let Err(e) = self
            .emulator
            .install(&tag)
            .and_then(|()| self.emulator.set_enabled(true))
        {
            inner.enabled = false;
            warn!(generation, error = %e, "card emulation failed to start");
            return Err(e);
        }

        let (tx, rx) = oneshot::channel();
        let payload_len = tag.ndef_file().len();
        inner.armed = Some(Armed {
            generation,
            tag,
            link: LinkState::default(),
            latch: Arc::new(AtomicBool::new(false)),
            notify: Some(tx),
        });
        inner.enabled = true;

        info!(generation, payload_len, "card emulation armed");
        Ok(SessionHandle {
            generation,
            read: rx,
        })
    }

    /// Registers the callback fired on the first completed read of each
    /// arm. Replaces any previous callback.
    pub fn on_read<F>(&self, handler: F)
    where
        F: Fn(PayloadRead) + Send + Sync + 'static,
    {
        self.inner.lock().handler = Some(Arc::new(handler));
    }

    /// Turns the card off and drops the armed payload. Calling it on an
    /// idle session does nothing.
    pub fn disable(&self) -> Result<(), EmulationError> {
        let mut inner = self.inner.lock();
        if !inner.enabled && inner.armed.is_none() {
            return Ok(());
        }
        let generation = inner.armed.as_ref().map(|a| a.generation);
        inner.armed = None;
        inner.enabled = false;

        match self.emulator.set_enabled(false) {
            Ok(()) => {
                info!(?generation, "card emulation disabled");
                Ok(())
            }
            Err(e) => {
                warn!(?generation, error = %e, "card emulation failed to stop");
                Err(e)
            }
        }
    }

    /// Handles one command APDU from a reader and returns the response
    /// bytes. A completed NDEF read trips the latch.
    pub fn process_apdu(&self, command: &[u8]) -> Vec<u8> {
        let (response, tripped) = {
            let mut inner = self.inner.lock();
            let Some(armed) = inner.armed.as_mut() else {
                return ApduResponse::status(StatusWord::FILE_NOT_FOUND).to_bytes();
            };
            let out = armed.tag.respond(&mut armed.link, command);
            (out.response.to_bytes(), out.payload_read)
        };

        if tripped {
            self.record_read();
        }
        response
    }

    /// Reports a completed read of the current payload.
    ///
    /// Platforms that detect reads themselves call this directly. Returns
    /// `true` only for the call that tripped the latch.
    pub fn record_read(&self) -> bool {
        let (event, notify, handler) = {
            let mut inner = self.inner.lock();
            let handler = inner.handler.clone();
            let Some(armed) = inner.armed.as_mut() else {
                return false;
            };
            if armed
                .latch
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!(generation = armed.generation, "duplicate read ignored");
                return false;
            }
            let event = PayloadRead {
                generation: armed.generation,
                payload_len: armed.tag.ndef_file().len(),
            };
            (event, armed.notify.take(), handler)
        };

        info!(generation = event.generation, "payload read by reader");
        if let Some(tx) = notify {
            let _ = tx.send(event);
        }
        if let Some(handler) = handler {
            handler(event);
        }
        true
    }

    /// The reader left the field. Selection state is dropped; the armed
    /// payload and latch are kept.
    pub fn link_lost(&self) {
        if let Some(armed) = self.inner.lock().armed.as_mut() {
            armed.link = LinkState::default();
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        match &self.inner.lock().armed {
            None => SessionState::Idle,
            Some(armed) => SessionState::Armed {
                generation: armed.generation,
                read: armed.latch.load(Ordering::Acquire),
            },
        }
    }

    /// Whether the card is currently on.
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }
}

impl<E: CardEmulator> Drop for HceSession<E> {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            warn!(error = %e, "card emulation left enabled on drop");
        }
    }
}

/// Failure to arm from a [`PaymentRequest`].
#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    /// The request could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The platform refused to start emulation.
    #[error(transparent)]
    Emulation(#[from] EmulationError),
}

impl From<ArmError> for TapError {
    fn from(e: ArmError) -> Self {
        match e {
            ArmError::Protocol(e) => TapError::Protocol(e),
            ArmError::Emulation(e) => TapError::Emulation(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::request::Token;
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FlakyEmulator {
        fail_start: AtomicBool,
        fail_stop: AtomicBool,
        disables: AtomicUsize,
    }

    impl CardEmulator for Arc<FlakyEmulator> {
        fn install(&self, _tag: &TagImage) -> Result<(), EmulationError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(EmulationError::StartFailed("service busy".into()));
            }
            Ok(())
        }

        fn set_enabled(&self, enabled: bool) -> Result<(), EmulationError> {
            if !enabled {
                self.disables.fetch_add(1, Ordering::SeqCst);
                if self.fail_stop.load(Ordering::SeqCst) {
                    return Err(EmulationError::StopFailed("service gone".into()));
                }
            }
            Ok(())
        }
    }

    fn sample() -> PaymentRequest {
        PaymentRequest::new(Token::SOL, Decimal::new(15, 1), "Addr1").unwrap()
    }

    fn counting_session() -> (HceSession<InProcessEmulator>, Arc<AtomicUsize>) {
        let session = HceSession::new(InProcessEmulator);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session.on_read(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (session, fired)
    }

    fn read_everything(session: &HceSession<InProcessEmulator>) -> Vec<u8> {
        session.process_apdu(&config::SELECT_APPLICATION_COMMAND);
        session.process_apdu(&config::SELECT_FILE_COMMAND);
        session.process_apdu(&config::READ_BINARY_COMMAND)
    }

    #[test]
    fn rapid_reads_fire_once() {
        let (session, fired) = counting_session();
        session.arm_request(&sample()).unwrap();

        assert!(session.record_read());
        assert!(!session.record_read());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_reads_fire_once() {
        let (session, fired) = counting_session();
        session.arm_request(&sample()).unwrap();
        let session = Arc::new(session);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.record_read())
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rearm_resets_latch() {
        let (session, fired) = counting_session();

        session.arm_request(&sample()).unwrap();
        read_everything(&session);
        read_everything(&session);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        session.arm_request(&sample()).unwrap();
        read_everything(&session);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn served_payload_decodes() {
        let session = HceSession::new(InProcessEmulator);
        session.arm_request(&sample()).unwrap();
        let response = read_everything(&session);
        assert_eq!(&response[response.len() - 2..], &[0x90, 0x00]);
        assert_eq!(request::decode(&response).unwrap(), sample());
    }

    #[tokio::test]
    async fn handle_resolves_on_read() {
        let session = HceSession::new(InProcessEmulator);
        let handle = session.arm_request(&sample()).unwrap();
        assert_eq!(handle.generation(), 1);

        read_everything(&session);
        let event = handle.read().await.unwrap();
        assert_eq!(event.generation, 1);
        assert!(matches!(
            session.state(),
            SessionState::Armed { read: true, .. }
        ));
    }

    #[tokio::test]
    async fn superseded_handle_resolves_none() {
        let session = HceSession::new(InProcessEmulator);
        let first = session.arm_request(&sample()).unwrap();
        let second = session.arm_request(&sample()).unwrap();
        assert_eq!(second.generation(), 2);
        assert!(first.read().await.is_none());
    }

    #[test]
    fn disable_is_idempotent() {
        let emulator = Arc::new(FlakyEmulator::default());
        let session = HceSession::new(Arc::clone(&emulator));
        session.arm_request(&sample()).unwrap();

        session.disable().unwrap();
        session.disable().unwrap();
        session.disable().unwrap();

        assert_eq!(emulator.disables.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_enabled());
    }

    #[test]
    fn disabled_card_answers_not_found() {
        let session = HceSession::new(InProcessEmulator);
        let response = session.process_apdu(&config::SELECT_APPLICATION_COMMAND);
        assert_eq!(response, vec![0x6A, 0x82]);
        assert!(!session.record_read());
    }

    #[test]
    fn emulation_errors_are_not_fatal() {
        let emulator = Arc::new(FlakyEmulator::default());
        let session = HceSession::new(Arc::clone(&emulator));

        emulator.fail_start.store(true, Ordering::SeqCst);
        let err = session.arm_request(&sample()).unwrap_err();
        assert!(matches!(
            err,
            ArmError::Emulation(EmulationError::StartFailed(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);

        emulator.fail_start.store(false, Ordering::SeqCst);
        session.arm_request(&sample()).unwrap();
        assert!(session.is_enabled());

        emulator.fail_stop.store(true, Ordering::SeqCst);
        assert!(session.disable().is_err());
        assert_eq!(session.state(), SessionState::Idle);
        // Already off; no second platform call.
        assert!(session.disable().is_ok());
    }

    #[test]
    fn link_loss_requires_reselect() {
        let session = HceSession::new(InProcessEmulator);
        session.arm_request(&sample()).unwrap();
        session.process_apdu(&config::SELECT_APPLICATION_COMMAND);
        session.process_apdu(&config::SELECT_FILE_COMMAND);
        session.link_lost();
        assert_eq!(
            session.process_apdu(&config::READ_BINARY_COMMAND),
            vec![0x69, 0x86]
        );
    }
}
