//! # APDU Command Dispatcher
//!
//! Reader-side half of the tap. [`command`] frames ISO 7816-4 APDUs,
//! [`dispatcher`] runs the fixed SELECT/SELECT/READ exchange against one
//! connected target, and [`scanner`] keeps re-arming the reader until a
//! request is read or the caller cancels.

pub mod command;
pub mod dispatcher;
pub mod scanner;

pub use command::{ApduCommand, ApduResponse, StatusWord};
pub use dispatcher::{
    read_payment_request, read_raw_payload, ApduTarget, ExchangeStep, StatusPolicy, TargetGuard,
    EXCHANGE,
};
pub use scanner::{AcceptPolicy, ContinuousScanner, ScanNotice, ScanState, TagReader};
