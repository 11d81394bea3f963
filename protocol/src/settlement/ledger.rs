//! Ledger collaborator interfaces.
//!
//! The poller and the sender flow only ever need three things from the
//! ledger: recent signatures for an address, the balance metadata of one
//! transaction, and a way to submit a transfer someone else signed. These
//! traits keep those needs small enough to fake in tests; the JSON-RPC
//! implementation lives in [`crate::rpc`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerQueryError;
use crate::request::Token;

/// One entry of a signature listing, newest first as the ledger returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    /// Transaction signature (base58).
    pub signature: String,
    /// Slot the transaction landed in.
    pub slot: u64,
    /// Whether the transaction failed on chain.
    pub failed: bool,
}

/// SPL token balance of one account before or after a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    /// Index into [`TransactionDetail::account_keys`].
    pub account_index: usize,
    /// Token mint.
    pub mint: String,
    /// Wallet owning the token account, when the node reports it.
    pub owner: Option<String>,
    /// Raw amount in base units.
    pub amount: u64,
}

/// Balance metadata of a confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionDetail {
    /// Signature this detail belongs to.
    pub signature: String,
    /// Account keys in message order.
    pub account_keys: Vec<String>,
    /// Lamport balances before execution, indexed like `account_keys`.
    pub pre_balances: Vec<u64>,
    /// Lamport balances after execution, indexed like `account_keys`.
    pub post_balances: Vec<u64>,
    /// Token balances before execution.
    pub pre_token_balances: Vec<TokenBalance>,
    /// Token balances after execution.
    pub post_token_balances: Vec<TokenBalance>,
    /// Whether `meta.err` was set.
    pub failed: bool,
}

/// Parameters of a signature listing.
#[derive(Debug, Clone, Copy)]
pub struct SignatureQuery<'a> {
    /// Address whose history is listed.
    pub address: &'a str,
    /// Maximum entries returned.
    pub limit: usize,
    /// Stop before this signature (exclusive); `None` lists from the
    /// newest backwards.
    pub until: Option<&'a str>,
    /// Commitment level.
    pub commitment: &'a str,
}

/// Read access to the ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Lists signatures involving `query.address`, newest first.
    async fn recent_signatures(
        &self,
        query: SignatureQuery<'_>,
    ) -> Result<Vec<SignatureInfo>, LedgerQueryError>;

    /// Fetches balance metadata for one transaction. `None` when the node
    /// does not (yet) know the transaction.
    async fn transaction_detail(
        &self,
        signature: &str,
        commitment: &str,
    ) -> Result<Option<TransactionDetail>, LedgerQueryError>;
}

/// Everything a signer needs to produce a transfer transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    /// Paying wallet.
    pub payer: String,
    /// Receiving wallet.
    pub destination: String,
    /// Asset moved.
    pub token: Token,
    /// Amount in the token's base units.
    pub amount: u64,
    /// Blockhash the transaction must reference.
    pub recent_blockhash: String,
}

/// External wallet capability that builds and signs transfers.
///
/// Key material never enters this crate; the signer returns a fully
/// serialized, signed transaction.
pub trait TransferSigner: Send + Sync {
    /// Address of the paying wallet.
    fn payer(&self) -> String;

    /// Returns the wire bytes of a signed transaction for `intent`.
    fn sign_transfer(&self, intent: &TransferIntent) -> Result<Vec<u8>, LedgerQueryError>;
}

/// Write access to the ledger: submit a transfer and get its signature.
#[async_trait]
pub trait TransferSubmitter: Send + Sync {
    /// Has `signer` sign a transfer of `amount` base units of `token` to
    /// `destination`, submits it, and returns the transaction signature.
    async fn submit_transfer(
        &self,
        signer: &dyn TransferSigner,
        destination: &str,
        token: Token,
        amount: u64,
    ) -> Result<String, LedgerQueryError>;
}
