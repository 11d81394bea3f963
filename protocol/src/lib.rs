// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # TapPay Protocol — Core Library
//!
//! Two phones, one tap, one payment. The receiving phone pretends to be a
//! contactless tag carrying a small JSON payment request; the paying phone
//! reads it over ISO 7816 APDUs, pays it, and the receiver confirms the
//! transfer by watching the ledger.
//!
//! ## Architecture
//!
//! - **config** — APDU bytes, file limits, timing, clusters. One home for
//!   every magic number.
//! - **error** — failure classes, all recoverable at the attempt or cycle
//!   boundary.
//! - **request** — the payment request and its NDEF payload codec.
//! - **apdu** — reader side: command framing, the three-step exchange,
//!   and the continuous scan loop.
//! - **hce** — card side: Type 4 tag image, session lifecycle, read latch.
//! - **settlement** — ledger traits, sender attribution, and the poller.
//! - **rpc** — JSON-RPC ledger client.
//! - **flow** — receiver and sender roles end to end.
//!
//! ## Ground rules
//!
//! 1. Nothing here is fatal to the host. Every error is recoverable at the
//!    attempt or poll-cycle boundary.
//! 2. Amounts are decimals in whole tokens; base units only at the ledger
//!    edge.
//! 3. Key material never enters this crate. Signing is somebody else's job.

pub mod apdu;
pub mod config;
pub mod error;
pub mod flow;
pub mod hce;
pub mod request;
pub mod rpc;
pub mod settlement;

pub use error::{EmulationError, LedgerQueryError, ProtocolError, TapError, TransportError};
pub use request::{PaymentMode, PaymentRequest, Token};
