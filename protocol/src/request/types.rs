//! Core type definitions for payment requests.
//!
//! Amounts are [`Decimal`] in whole-token units (1.5 SOL is `1.5`, not
//! 1_500_000_000 lamports). Conversion to the ledger's integer base units
//! happens only at the edges, through [`Token::to_base_units`] and
//! [`Token::from_base_units`].

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config;
use crate::error::ProtocolError;

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Tokens a tap can request.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Token {
    /// Native SOL (smallest unit: lamport, 10^-9).
    SOL,
    /// USD Coin SPL token (smallest unit: 10^-6).
    USDC,
}

impl Token {
    /// Every token the protocol recognizes.
    pub const ALL: [Token; 2] = [Token::SOL, Token::USDC];

    /// Ticker as it appears on the wire.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::SOL => "SOL",
            Self::USDC => "USDC",
        }
    }

    /// Number of decimal places between a whole token and a base unit.
    pub fn decimals(&self) -> u32 {
        match self {
            Self::SOL => config::SOL_DECIMALS,
            Self::USDC => config::USDC_DECIMALS,
        }
    }

    /// Whether balances for this token live in the native lamport columns
    /// rather than in SPL token balance entries.
    pub fn is_native(&self) -> bool {
        matches!(self, Self::SOL)
    }

    /// Converts a whole-token amount into integer base units.
    ///
    /// Returns `None` if the amount is negative, carries more precision than
    /// the token supports, or overflows `u64`.
    pub fn to_base_units(&self, amount: Decimal) -> Option<u64> {
        if amount.is_sign_negative() {
            return None;
        }
        let scaled = amount.checked_mul(Decimal::from(10u64.pow(self.decimals())))?;
        if !scaled.fract().is_zero() {
            return None;
        }
        scaled.trunc().to_u64()
    }

    /// Converts integer base units back into a whole-token amount.
    pub fn from_base_units(&self, units: u64) -> Decimal {
        Decimal::from_i128_with_scale(units as i128, self.decimals()).normalize()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl FromStr for Token {
    type Err = ProtocolError;

    /// Case-sensitive, matching what the card side writes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SOL" => Ok(Self::SOL),
            "USDC" => Ok(Self::USDC),
            other => Err(ProtocolError::UnsupportedToken(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// PaymentMode
// ---------------------------------------------------------------------------

/// Where the receiver wants the funds to land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    /// Straight into the receiver's wallet.
    #[default]
    Wallet,
    /// Through the receiver's on-chain distribution program.
    Program,
}

impl fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wallet => write!(f, "wallet"),
            Self::Program => write!(f, "program"),
        }
    }
}

impl FromStr for PaymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wallet" => Ok(Self::Wallet),
            "program" => Ok(Self::Program),
            other => Err(format!("unknown payment mode: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// PaymentRequest
// ---------------------------------------------------------------------------

/// What the receiver wants to be paid, as served over NFC.
///
/// Construct through [`PaymentRequest::new`] so that the invariants hold
/// (positive amount, plausible address). The decoder applies the same
/// checks to anything read off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Token to pay in.
    pub token: Token,
    /// Amount in whole-token units. A JSON number on the wire.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// Base58 address of the receiver.
    pub address: String,
    /// Settlement destination kind.
    #[serde(default)]
    pub mode: PaymentMode,
}

impl PaymentRequest {
    /// Builds a wallet-mode request and validates it.
    pub fn new(
        token: Token,
        amount: Decimal,
        address: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let request = Self {
            token,
            amount,
            address: address.into(),
            mode: PaymentMode::Wallet,
        };
        request.validate()?;
        Ok(request)
    }

    /// Returns the request with a different settlement mode.
    pub fn with_mode(mut self, mode: PaymentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Checks the invariants every request must satisfy.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.amount <= Decimal::ZERO {
            return Err(ProtocolError::InvalidPayload(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        validate_precision(self.token, self.amount)?;
        validate_address(&self.address)
    }

    /// Amount expressed in the token's base units.
    pub fn base_units(&self) -> Result<u64, ProtocolError> {
        self.token.to_base_units(self.amount).ok_or_else(|| {
            ProtocolError::InvalidPayload(format!(
                "amount {} not representable in {} base units",
                self.amount, self.token
            ))
        })
    }
}

impl fmt::Display for PaymentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} to {}", self.amount, self.token, self.address)
    }
}

/// The amount must be a whole number of base units and must come back
/// unchanged from the JSON number it travels as.
pub(crate) fn validate_precision(token: Token, amount: Decimal) -> Result<(), ProtocolError> {
    if token.to_base_units(amount).is_none() {
        return Err(ProtocolError::InvalidPayload(format!(
            "amount {} not representable in {} base units",
            amount, token
        )));
    }
    let on_wire = amount
        .to_f64()
        .and_then(|f| Decimal::from_str(&f.to_string()).ok());
    if on_wire != Some(amount) {
        return Err(ProtocolError::InvalidPayload(format!(
            "amount {} has more significant digits than a JSON number keeps",
            amount
        )));
    }
    Ok(())
}

/// Longest base58 string a 32-byte key can produce.
const MAX_ADDRESS_LEN: usize = 44;

/// An address must be non-empty base58 text no longer than a public key.
pub(crate) fn validate_address(address: &str) -> Result<(), ProtocolError> {
    if address.is_empty() {
        return Err(ProtocolError::MissingField("address"));
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(ProtocolError::InvalidPayload(format!(
            "address too long: {} chars",
            address.len()
        )));
    }
    bs58::decode(address)
        .into_vec()
        .map_err(|e| ProtocolError::InvalidPayload(format!("address is not base58: {}", e)))?;
    Ok(())
}
