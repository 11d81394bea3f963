//! Error types for the tap-to-pay flow.
//!
//! Failures are split by where they happen: the bytes on the NFC link
//! ([`ProtocolError`]), the NFC hardware itself ([`TransportError`]), the
//! ledger RPC ([`LedgerQueryError`]) and the card-emulation capability
//! ([`EmulationError`]). None of them is fatal to the host process; each is
//! recovered at the attempt or poll-cycle boundary.

use thiserror::Error;

use crate::apdu::StatusWord;

/// The bytes exchanged over the contactless link were not what we expected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// SELECT-file answered with something other than `90 00`.
    #[error("file select rejected with status {status}")]
    FileSelectRejected {
        /// Status word returned by the target.
        status: StatusWord,
    },

    /// The payload could not be located or parsed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The payload names a token we do not handle.
    #[error("unsupported token: {0}")]
    UnsupportedToken(String),

    /// A required payload field is absent or empty.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The encoded request does not fit in a single READ-binary.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Largest readable file.
        max: usize,
    },

    /// The caller declined an otherwise valid request (e.g. wallet cannot
    /// pay in that token).
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// The NFC reader or the tapped target misbehaved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No reader hardware, or NFC is switched off.
    #[error("reader unavailable: {0}")]
    ReaderUnavailable(String),

    /// The target left the field before the exchange finished.
    #[error("target lost during exchange")]
    TargetLost,

    /// The target answered with fewer than two bytes (no status word).
    #[error("truncated response: {len} bytes")]
    TruncatedResponse {
        /// Length of what we received.
        len: usize,
    },

    /// Any other I/O failure reported by the platform.
    #[error("transceive failed: {0}")]
    Io(String),
}

/// A ledger query failed. Logged and skipped; the next cycle retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerQueryError {
    /// HTTP or connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The query did not complete in time.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the node.
        message: String,
    },

    /// The node answered with something we could not interpret.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The external signer refused or failed to sign.
    #[error("signing failed: {0}")]
    Signing(String),
}

/// The platform could not start or stop the virtual card.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmulationError {
    /// The device has no host card emulation support.
    #[error("card emulation not supported on this device")]
    Unsupported,

    /// Installing the tag or enabling the service failed.
    #[error("failed to start card emulation: {0}")]
    StartFailed(String),

    /// Disabling the service failed.
    #[error("failed to stop card emulation: {0}")]
    StopFailed(String),
}

/// Umbrella error for the role flows.
#[derive(Debug, Error)]
pub enum TapError {
    /// See [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// See [`LedgerQueryError`].
    #[error(transparent)]
    Ledger(#[from] LedgerQueryError),

    /// See [`EmulationError`].
    #[error(transparent)]
    Emulation(#[from] EmulationError),

    /// The flow was cancelled before it produced a result.
    #[error("cancelled")]
    Cancelled,
}

impl TapError {
    /// Whether a fresh attempt (next tap, next poll tick) may succeed.
    ///
    /// Only cancellation and a missing emulation capability are terminal
    /// for the current flow; neither is fatal to the host.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::Emulation(EmulationError::Unsupported)
        )
    }
}

/// Convenience alias for results in this crate.
pub type Result<T, E = TapError> = std::result::Result<T, E>;
