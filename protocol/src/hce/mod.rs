//! Card side of the tap: serving a payment request as an emulated
//! NFC Forum Type 4 tag.
//!
//! - [`tag`] answers individual APDUs from the two read-only files.
//! - [`session`] owns the virtual card's lifecycle and the one-shot read
//!   latch.
//! - [`loopback`] connects a reader to a session in the same process.

pub mod loopback;
pub mod session;
pub mod tag;

pub use loopback::{LoopbackReader, LoopbackTarget};
pub use session::{
    ArmError, CardEmulator, HceSession, InProcessEmulator, PayloadRead, ReadHandler,
    SessionHandle, SessionState,
};
pub use tag::{LinkState, SelectedFile, TagImage, TagResponse};
