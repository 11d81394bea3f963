//! # Reader-Side APDU Exchange
//!
//! Reading a payment request off a tapped phone is a fixed three-step
//! conversation:
//!
//! ```text
//!   Reader                                   Card (HCE)
//!     │  SELECT app  00A40400 07 D2760000850101 00 │
//!     ├──────────────────────────────────────────►│   status not enforced
//!     │  SELECT file 00A4000C 02 E104             │
//!     ├──────────────────────────────────────────►│   must be 90 00
//!     │  READ BINARY 00B00000 FF                  │
//!     ├──────────────────────────────────────────►│   data ‖ 90 00
//! ```
//!
//! The application select is deliberately permissive: some targets accept
//! an alternate application yet still expose the NDEF file, so only the
//! file select gates the read.
//!
//! The target handle is borrowed mutably for the whole exchange; releasing
//! it is the caller's job (see [`TargetGuard`]).

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config;
use crate::error::{ProtocolError, TapError, TransportError};
use crate::request::{self, PaymentRequest};

use super::command::ApduResponse;

// ---------------------------------------------------------------------------
// Target abstraction
// ---------------------------------------------------------------------------

/// A connected contactless target (an IsoDep tag, or a phone emulating one).
#[async_trait]
pub trait ApduTarget: Send {
    /// Sends one command APDU and returns the raw response, status word
    /// included.
    async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Gives the reader hardware back. Must be safe to call more than once.
    fn release(&mut self);
}

/// Owns a target for one exchange and releases it on drop, so that every
/// exit path (success, validation failure, I/O error, cancellation) hands
/// the hardware back before the next attempt.
pub struct TargetGuard<T: ApduTarget> {
    target: T,
}

impl<T: ApduTarget> TargetGuard<T> {
    /// Takes ownership of a freshly connected target.
    pub fn new(target: T) -> Self {
        Self { target }
    }

    /// Mutable access for the exchange.
    pub fn target(&mut self) -> &mut T {
        &mut self.target
    }
}

impl<T: ApduTarget> Drop for TargetGuard<T> {
    fn drop(&mut self) {
        self.target.release();
    }
}

// ---------------------------------------------------------------------------
// Exchange steps
// ---------------------------------------------------------------------------

/// What a non-`90 00` status means for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPolicy {
    /// Logged, and the exchange continues.
    Tolerate,
    /// Aborts with [`ProtocolError::FileSelectRejected`].
    RejectFileSelect,
    /// Aborts with [`ProtocolError::InvalidPayload`].
    RejectRead,
}

/// One step of the fixed exchange.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeStep {
    /// Name used in logs.
    pub name: &'static str,
    /// Command bytes sent verbatim.
    pub command: &'static [u8],
    /// How a failing status word is handled.
    pub on_failure: StatusPolicy,
}

/// SELECT-application, SELECT-file, READ-binary, in that order.
pub const EXCHANGE: [ExchangeStep; 3] = [
    ExchangeStep {
        name: "select-application",
        command: &config::SELECT_APPLICATION_COMMAND,
        on_failure: StatusPolicy::Tolerate,
    },
    ExchangeStep {
        name: "select-file",
        command: &config::SELECT_FILE_COMMAND,
        on_failure: StatusPolicy::RejectFileSelect,
    },
    ExchangeStep {
        name: "read-binary",
        command: &config::READ_BINARY_COMMAND,
        on_failure: StatusPolicy::RejectRead,
    },
];

/// Runs the three-step exchange and returns the READ-binary body with the
/// status word stripped.
///
/// # Errors
///
/// - [`ProtocolError::FileSelectRejected`] if SELECT-file is not `90 00`;
///   READ-binary is never sent in that case.
/// - [`ProtocolError::InvalidPayload`] if READ-binary itself fails.
/// - [`TransportError`] for anything the link reports.
pub async fn read_raw_payload<T>(target: &mut T) -> Result<Vec<u8>, TapError>
where
    T: ApduTarget + ?Sized,
{
    run_steps(target, &EXCHANGE).await
}

/// Sends `steps` in order and returns the body of the last response.
async fn run_steps<T>(target: &mut T, steps: &[ExchangeStep]) -> Result<Vec<u8>, TapError>
where
    T: ApduTarget + ?Sized,
{
    let mut body = Vec::new();
    for step in steps {
        let response = send(target, step).await?;
        if !response.status.is_success() {
            match step.on_failure {
                StatusPolicy::Tolerate => {
                    debug!(
                        step = step.name,
                        status = %response.status,
                        "status not accepted, continuing"
                    );
                }
                StatusPolicy::RejectFileSelect => {
                    warn!(status = %response.status, "file select rejected");
                    return Err(ProtocolError::FileSelectRejected {
                        status: response.status,
                    }
                    .into());
                }
                StatusPolicy::RejectRead => {
                    return Err(ProtocolError::InvalidPayload(format!(
                        "{} returned status {}",
                        step.name, response.status
                    ))
                    .into());
                }
            }
        }
        body = response.data;
    }

    debug!(bytes = body.len(), "payload read");
    Ok(body)
}

/// Runs the exchange and decodes the payment request it carries.
pub async fn read_payment_request<T>(target: &mut T) -> Result<PaymentRequest, TapError>
where
    T: ApduTarget + ?Sized,
{
    let raw = read_raw_payload(target).await?;
    let request = request::decode(&raw)?;
    debug!(token = %request.token, amount = %request.amount, "payment request decoded");
    Ok(request)
}

async fn send<T>(target: &mut T, step: &ExchangeStep) -> Result<ApduResponse, TapError>
where
    T: ApduTarget + ?Sized,
{
    let raw = target.transceive(step.command).await?;
    let response = ApduResponse::parse(raw)?;
    debug!(step = step.name, status = %response.status, "apdu exchanged");
    Ok(response)
}
