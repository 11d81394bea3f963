//! # Payment Requests
//!
//! The receiving phone composes a [`PaymentRequest`] ("send me 1.5 SOL at
//! this address"), the [`codec`] packs it into the NDEF file the card
//! emulator serves, and the paying phone unpacks it after the APDU read.
//!
//! ```text
//!   PaymentRequest ──encode──► EncodedPayload (NDEF file, ≤ 255 bytes)
//!                                      │
//!                              READ-binary over NFC
//!                                      │
//!   PaymentRequest ◄──decode── raw response buffer (padding tolerated)
//! ```
//!
//! A request is immutable once encoded and is consumed exactly once by the
//! reading side.

pub mod codec;
pub mod types;

pub use codec::{decode, encode, locate_json, EncodedPayload};
pub use types::{PaymentMode, PaymentRequest, Token};
