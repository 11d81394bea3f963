//! # Settlement Confirmation
//!
//! Receiver-side detection of the incoming transfer that answers a tap.
//!
//! - [`ledger`] declares what we need from the ledger (and from the
//!   external signer on the paying side).
//! - [`attribution`] turns a transaction's balance columns into "who sent
//!   how much".
//! - [`poller`] walks the target address's new signatures on a timer until
//!   one attributes.

pub mod attribution;
pub mod ledger;
pub mod poller;

pub use attribution::{BalanceChange, Receipt};
pub use ledger::{
    LedgerClient, SignatureInfo, SignatureQuery, TokenBalance, TransactionDetail, TransferIntent,
    TransferSigner, TransferSubmitter,
};
pub use poller::{PollerHandle, SettlementCursor, SettlementPoller, SettlementResult, WatchTarget};
