//! # Payload Codec
//!
//! Packs a [`PaymentRequest`] into the NDEF file served by the card
//! emulator and recovers it from whatever the reader pulled off the link.
//!
//! ## Container
//!
//! ```text
//! ┌──────┬────────────────────────── NDEF message ──────────────────────────┐
//! │ NLEN │ D1 01 <plen> 'T' │ 02 'e' 'n' │ {"token":"SOL","amount":1.5,...} │
//! │ u16  │  record header   │ status+lang│            JSON text             │
//! └──────┴──────────────────┴────────────┴──────────────────────────────────┘
//! ```
//!
//! The decoder does not parse the container. It slices from the first `{`
//! that opens an object to the last `}` and parses that as JSON, so NLEN
//! bytes, record headers, zero padding and trailing status words are all
//! tolerated. A buffer with either delimiter missing is a decode failure,
//! never a panic.
//!
//! NLEN and the record payload length are single bytes in front of the
//! JSON and can land on `0x7B`. The encoder pads the JSON with one trailing
//! space when that would happen, so even a reader that takes the very first
//! `{` finds the object.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use crate::config;
use crate::error::ProtocolError;

use super::types::{validate_address, validate_precision, PaymentMode, PaymentRequest, Token};

/// NDEF record header: MB | ME | SR, TNF = well-known.
const TEXT_RECORD_HEADER: u8 = 0xD1;

/// Well-known record type `T` (text).
const TEXT_RECORD_TYPE: u8 = b'T';

/// Text record status byte: UTF-8, two-byte language code.
const TEXT_STATUS_UTF8_EN: u8 = 0x02;

const TEXT_LANGUAGE: &[u8; 2] = b"en";

/// Bytes in front of the JSON text: NLEN, record header, type length,
/// payload length, type, status byte and language code.
const CONTAINER_OVERHEAD: usize = 2 + 4 + 1 + TEXT_LANGUAGE.len();

// ---------------------------------------------------------------------------
// EncodedPayload
// ---------------------------------------------------------------------------

/// Raw NDEF file contents, ready to be served by READ-binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedPayload(Vec<u8>);

impl EncodedPayload {
    /// The file bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// File size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the payload and returns the bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Lowercase hex dump, for logs and the CLI.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<Vec<u8>> for EncodedPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for EncodedPayload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encodes a request as a single-record NDEF file.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] when the file would not fit
/// in one READ-binary of [`config::MAX_FILE_SIZE`] bytes, and propagates
/// validation failures of the request itself.
pub fn encode(request: &PaymentRequest) -> Result<EncodedPayload, ProtocolError> {
    request.validate()?;

    let mut json = serde_json::to_vec(request)
        .map_err(|e| ProtocolError::InvalidPayload(format!("serialize: {}", e)))?;
    if length_bytes(json.len()).contains(&b'{') {
        json.push(b' ');
    }

    let size = CONTAINER_OVERHEAD + json.len();
    if size > config::MAX_FILE_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size,
            max: config::MAX_FILE_SIZE,
        });
    }

    let [nlen_hi, nlen_lo, record_payload_len] = length_bytes(json.len());

    let mut file = Vec::with_capacity(size);
    file.extend_from_slice(&[nlen_hi, nlen_lo]);
    file.push(TEXT_RECORD_HEADER);
    file.push(1);
    file.push(record_payload_len);
    file.push(TEXT_RECORD_TYPE);
    file.push(TEXT_STATUS_UTF8_EN);
    file.extend_from_slice(TEXT_LANGUAGE);
    file.extend_from_slice(&json);

    Ok(EncodedPayload(file))
}

/// NLEN (big-endian) and the record payload length for a JSON body of
/// `json_len` bytes. Only meaningful once the file is known to fit.
fn length_bytes(json_len: usize) -> [u8; 3] {
    let record_payload_len = 1 + TEXT_LANGUAGE.len() + json_len;
    let message_len = 4 + record_payload_len;
    let [hi, lo] = (message_len as u16).to_be_bytes();
    [hi, lo, record_payload_len as u8]
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Returns the slice spanning the first `{` that opens an object through
/// the last `}`.
///
/// A `{` counts as an opener when the next non-whitespace byte is `"` or
/// `}`. Stray `0x7B` bytes in a length field fail that test. If no brace
/// qualifies, the first `{` is used and JSON parsing reports the problem.
pub fn locate_json(buffer: &[u8]) -> Result<&[u8], ProtocolError> {
    let mut braces = buffer
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'{')
        .map(|(i, _)| i);
    let first = braces
        .next()
        .ok_or_else(|| ProtocolError::InvalidPayload("no opening brace".to_string()))?;
    let start = std::iter::once(first)
        .chain(braces)
        .find(|&i| opens_object(&buffer[i + 1..]))
        .unwrap_or(first);
    let end = buffer
        .iter()
        .rposition(|&b| b == b'}')
        .ok_or_else(|| ProtocolError::InvalidPayload("no closing brace".to_string()))?;
    if end < start {
        return Err(ProtocolError::InvalidPayload(
            "closing brace precedes opening brace".to_string(),
        ));
    }
    Ok(&buffer[start..=end])
}

fn opens_object(rest: &[u8]) -> bool {
    matches!(
        rest.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'"') | Some(b'}')
    )
}

/// Loosely-typed view of the JSON so that each missing or malformed field
/// maps to its own error instead of a generic serde failure.
#[derive(Deserialize)]
struct WireRequest {
    token: Option<String>,
    amount: Option<serde_json::Value>,
    address: Option<String>,
    #[serde(default)]
    mode: Option<PaymentMode>,
}

/// Decodes a request from a raw buffer containing its JSON text.
///
/// Checks, in order: the token is recognized, the amount is a positive
/// number, and the address is present and base58.
pub fn decode(buffer: &[u8]) -> Result<PaymentRequest, ProtocolError> {
    let json = locate_json(buffer)?;
    let wire: WireRequest = serde_json::from_slice(json)
        .map_err(|e| ProtocolError::InvalidPayload(format!("json: {}", e)))?;

    let token = match wire.token {
        Some(symbol) => Token::from_str(&symbol)?,
        None => return Err(ProtocolError::MissingField("token")),
    };

    let amount = match wire.amount {
        None | Some(serde_json::Value::Null) => return Err(ProtocolError::MissingField("amount")),
        Some(serde_json::Value::Number(n)) => parse_amount(&n.to_string())?,
        Some(other) => {
            return Err(ProtocolError::InvalidPayload(format!(
                "amount is not a number: {}",
                other
            )))
        }
    };
    if amount <= Decimal::ZERO {
        return Err(ProtocolError::MissingField("amount"));
    }
    validate_precision(token, amount)?;

    let address = wire.address.unwrap_or_default();
    validate_address(&address)?;

    Ok(PaymentRequest {
        token,
        amount,
        address,
        mode: wire.mode.unwrap_or_default(),
    })
}

/// serde_json prints large or tiny floats in exponent form.
fn parse_amount(text: &str) -> Result<Decimal, ProtocolError> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|e| ProtocolError::InvalidPayload(format!("amount {}: {}", text, e)))
}
