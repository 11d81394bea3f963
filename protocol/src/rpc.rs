//! # JSON-RPC Ledger Client
//!
//! [`RpcLedgerClient`] speaks JSON-RPC 2.0 over HTTP to a Solana-compatible
//! node and implements the settlement collaborator traits.
//!
//! ## Method Index
//!
//! | Method                      | Used for                                   |
//! |-----------------------------|--------------------------------------------|
//! | `getSignaturesForAddress`   | cursor seed and per-cycle listing          |
//! | `getTransaction`            | balance columns of one transaction         |
//! | `getLatestBlockhash`        | recent blockhash handed to the signer      |
//! | `sendTransaction`           | submitting the signer's transaction        |
//!
//! Transport failures become [`LedgerQueryError::Network`] or
//! [`LedgerQueryError::Timeout`]; a JSON-RPC error object becomes
//! [`LedgerQueryError::Rpc`]; anything that does not parse becomes
//! [`LedgerQueryError::MalformedResponse`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::{self, Cluster};
use crate::error::LedgerQueryError;
use crate::request::Token;
use crate::settlement::ledger::{
    LedgerClient, SignatureInfo, SignatureQuery, TokenBalance, TransactionDetail, TransferIntent,
    TransferSigner, TransferSubmitter,
};

// ---------------------------------------------------------------------------
// RPC Method Enumeration
// ---------------------------------------------------------------------------

/// JSON-RPC methods this client calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMethod {
    /// Signatures involving an address, newest first.
    #[serde(rename = "getSignaturesForAddress")]
    GetSignaturesForAddress,
    /// A confirmed transaction with its status metadata.
    #[serde(rename = "getTransaction")]
    GetTransaction,
    /// The latest blockhash.
    #[serde(rename = "getLatestBlockhash")]
    GetLatestBlockhash,
    /// Submit a signed transaction.
    #[serde(rename = "sendTransaction")]
    SendTransaction,
}

// ---------------------------------------------------------------------------
// RPC Request / Response
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Request identifier, echoed back in the response.
    pub id: u64,
    /// The method to invoke.
    pub method: RpcMethod,
    /// Positional parameters.
    pub params: Value,
}

impl RpcRequest {
    /// Creates a request for `method`.
    pub fn new(id: u64, method: RpcMethod, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method,
            params,
        }
    }
}

/// A JSON-RPC 2.0 response. Exactly one of `result` or `error` is
/// meaningful; a `null` result is valid for lookups that found nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    /// Echoed request identifier.
    #[serde(default)]
    pub id: Value,
    /// Method result.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error object, if the call failed.
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcError> for LedgerQueryError {
    fn from(e: RpcError) -> Self {
        LedgerQueryError::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireSignature {
    signature: String,
    slot: u64,
    #[serde(default)]
    err: Option<Value>,
}

impl From<WireSignature> for SignatureInfo {
    fn from(w: WireSignature) -> Self {
        SignatureInfo {
            signature: w.signature,
            slot: w.slot,
            failed: w.err.is_some(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    #[serde(default)]
    meta: Option<WireMeta>,
    transaction: WireEnvelope,
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    account_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    pre_balances: Vec<u64>,
    #[serde(default)]
    post_balances: Vec<u64>,
    #[serde(default)]
    pre_token_balances: Vec<WireTokenBalance>,
    #[serde(default)]
    post_token_balances: Vec<WireTokenBalance>,
    #[serde(default)]
    loaded_addresses: Option<WireLoadedAddresses>,
}

/// Address-table lookups of versioned transactions. Their balances follow
/// the static keys, writable first.
#[derive(Debug, Deserialize)]
struct WireLoadedAddresses {
    #[serde(default)]
    writable: Vec<String>,
    #[serde(default)]
    readonly: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTokenBalance {
    account_index: usize,
    mint: String,
    #[serde(default)]
    owner: Option<String>,
    ui_token_amount: WireTokenAmount,
}

#[derive(Debug, Deserialize)]
struct WireTokenAmount {
    amount: String,
}

impl WireTokenBalance {
    fn into_balance(self) -> Result<TokenBalance, LedgerQueryError> {
        let amount = self.ui_token_amount.amount.parse::<u64>().map_err(|e| {
            LedgerQueryError::MalformedResponse(format!(
                "token amount {:?}: {}",
                self.ui_token_amount.amount, e
            ))
        })?;
        Ok(TokenBalance {
            account_index: self.account_index,
            mint: self.mint,
            owner: self.owner,
            amount,
        })
    }
}

fn into_detail(signature: &str, wire: WireTransaction) -> Result<TransactionDetail, LedgerQueryError> {
    let mut account_keys = wire.transaction.message.account_keys;
    let Some(meta) = wire.meta else {
        return Ok(TransactionDetail {
            signature: signature.to_string(),
            account_keys,
            ..Default::default()
        });
    };

    if let Some(loaded) = meta.loaded_addresses {
        account_keys.extend(loaded.writable);
        account_keys.extend(loaded.readonly);
    }

    let tokens = |balances: Vec<WireTokenBalance>| {
        balances
            .into_iter()
            .map(WireTokenBalance::into_balance)
            .collect::<Result<Vec<_>, _>>()
    };

    Ok(TransactionDetail {
        signature: signature.to_string(),
        account_keys,
        pre_balances: meta.pre_balances,
        post_balances: meta.post_balances,
        pre_token_balances: tokens(meta.pre_token_balances)?,
        post_token_balances: tokens(meta.post_token_balances)?,
        failed: meta.err.is_some(),
    })
}

#[derive(Debug, Deserialize)]
struct WireBlockhash {
    value: WireBlockhashValue,
}

#[derive(Debug, Deserialize)]
struct WireBlockhashValue {
    blockhash: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP JSON-RPC client for a ledger node.
pub struct RpcLedgerClient {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
    commitment: String,
    next_id: AtomicU64,
}

impl RpcLedgerClient {
    /// Creates a client for `url` with the default timeout.
    pub fn new(url: impl Into<String>) -> Result<Self, LedgerQueryError> {
        Self::with_timeout(url, config::RPC_TIMEOUT)
    }

    /// Creates a client with an explicit per-request timeout.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerQueryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerQueryError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
            timeout,
            commitment: config::DEFAULT_COMMITMENT.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Creates a client for the cluster's public endpoint.
    pub fn for_cluster(cluster: Cluster) -> Result<Self, LedgerQueryError> {
        Self::new(cluster.rpc_url())
    }

    /// Commitment used by the write path (blockhash, preflight).
    pub fn with_commitment(mut self, commitment: impl Into<String>) -> Self {
        self.commitment = commitment.into();
        self
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Performs one call and deserializes its `result`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: RpcMethod,
        params: Value,
    ) -> Result<T, LedgerQueryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerQueryError::Network(format!(
                "http {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let envelope: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerQueryError::MalformedResponse(format!("{:?}: {}", method, e)))?;

        if let Some(error) = envelope.error {
            debug!(?method, code = error.code, message = %error.message, "rpc error");
            return Err(error.into());
        }

        serde_json::from_value(envelope.result.unwrap_or(Value::Null))
            .map_err(|e| LedgerQueryError::MalformedResponse(format!("{:?} result: {}", method, e)))
    }

    /// Fetches a recent blockhash for the signer.
    pub async fn latest_blockhash(&self) -> Result<String, LedgerQueryError> {
        let wire: WireBlockhash = self
            .call(
                RpcMethod::GetLatestBlockhash,
                json!([{ "commitment": self.commitment }]),
            )
            .await?;
        Ok(wire.value.blockhash)
    }

    /// Submits signed transaction bytes and returns the signature.
    pub async fn send_transaction(&self, wire: &[u8]) -> Result<String, LedgerQueryError> {
        let encoded = bs58::encode(wire).into_string();
        self.call(
            RpcMethod::SendTransaction,
            json!([encoded, { "encoding": "base58", "preflightCommitment": self.commitment }]),
        )
        .await
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> LedgerQueryError {
        if e.is_timeout() {
            LedgerQueryError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            LedgerQueryError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn recent_signatures(
        &self,
        query: SignatureQuery<'_>,
    ) -> Result<Vec<SignatureInfo>, LedgerQueryError> {
        let mut options = json!({
            "limit": query.limit,
            "commitment": query.commitment,
        });
        if let Some(until) = query.until {
            options["until"] = json!(until);
        }

        let wire: Vec<WireSignature> = self
            .call(
                RpcMethod::GetSignaturesForAddress,
                json!([query.address, options]),
            )
            .await?;
        Ok(wire.into_iter().map(SignatureInfo::from).collect())
    }

    async fn transaction_detail(
        &self,
        signature: &str,
        commitment: &str,
    ) -> Result<Option<TransactionDetail>, LedgerQueryError> {
        let wire: Option<WireTransaction> = self
            .call(
                RpcMethod::GetTransaction,
                json!([signature, {
                    "encoding": "json",
                    "commitment": commitment,
                    "maxSupportedTransactionVersion": 0,
                }]),
            )
            .await?;
        wire.map(|w| into_detail(signature, w)).transpose()
    }
}

#[async_trait]
impl TransferSubmitter for RpcLedgerClient {
    async fn submit_transfer(
        &self,
        signer: &dyn TransferSigner,
        destination: &str,
        token: Token,
        amount: u64,
    ) -> Result<String, LedgerQueryError> {
        let intent = TransferIntent {
            payer: signer.payer(),
            destination: destination.to_string(),
            token,
            amount,
            recent_blockhash: self.latest_blockhash().await?,
        };
        let wire = signer.sign_transfer(&intent)?;
        let signature = self.send_transaction(&wire).await?;
        info!(%signature, %token, amount, destination, "transfer submitted");
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_use_ledger_names() {
        let request = RpcRequest::new(7, RpcMethod::GetSignaturesForAddress, json!([]));
        let text = serde_json::to_string(&request).unwrap();
        assert!(text.contains(r#""method":"getSignaturesForAddress""#));
        assert!(text.contains(r#""jsonrpc":"2.0""#));
        assert!(text.contains(r#""id":7"#));
    }

    #[test]
    fn rpc_error_maps_to_ledger_error() {
        let err: LedgerQueryError = RpcError {
            code: -32009,
            message: "slot skipped".into(),
            data: None,
        }
        .into();
        assert_eq!(
            err,
            LedgerQueryError::Rpc {
                code: -32009,
                message: "slot skipped".into()
            }
        );
    }

    #[test]
    fn signature_err_marks_failure() {
        let wire: Vec<WireSignature> = serde_json::from_value(json!([
            { "signature": "ok", "slot": 5, "err": null, "memo": null },
            { "signature": "bad", "slot": 6, "err": { "InstructionError": [0, "Custom"] } }
        ]))
        .unwrap();
        let infos: Vec<SignatureInfo> = wire.into_iter().map(Into::into).collect();
        assert!(!infos[0].failed);
        assert!(infos[1].failed);
    }

    #[test]
    fn transaction_detail_from_wire() {
        let wire: WireTransaction = serde_json::from_value(json!({
            "slot": 10,
            "meta": {
                "err": null,
                "fee": 5000,
                "preBalances": [100, 50, 1],
                "postBalances": [80, 70, 1],
                "preTokenBalances": [{
                    "accountIndex": 3,
                    "mint": "Mint",
                    "owner": "A",
                    "uiTokenAmount": { "amount": "1000", "decimals": 6, "uiAmountString": "0.001" }
                }],
                "postTokenBalances": [],
                "loadedAddresses": { "writable": ["W"], "readonly": ["R"] }
            },
            "transaction": {
                "message": { "accountKeys": ["A", "B", "C"] },
                "signatures": ["sig"]
            }
        }))
        .unwrap();

        let detail = into_detail("sig", wire).unwrap();
        assert_eq!(detail.account_keys, vec!["A", "B", "C", "W", "R"]);
        assert_eq!(detail.pre_balances, vec![100, 50, 1]);
        assert_eq!(detail.pre_token_balances[0].amount, 1000);
        assert!(!detail.failed);
    }

    #[test]
    fn bad_token_amount_is_malformed() {
        let wire: WireTransaction = serde_json::from_value(json!({
            "meta": {
                "preTokenBalances": [{
                    "accountIndex": 0,
                    "mint": "Mint",
                    "uiTokenAmount": { "amount": "lots" }
                }]
            },
            "transaction": { "message": { "accountKeys": ["A"] } }
        }))
        .unwrap();
        assert!(matches!(
            into_detail("sig", wire),
            Err(LedgerQueryError::MalformedResponse(_))
        ));
    }
}
