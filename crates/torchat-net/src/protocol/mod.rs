//! Wire protocol: framing codec and typed messages.
//!
//! Messages are 0x0A-terminated runs of transfer-encoded bytes; the first
//! whitespace-delimited token names a command, the remainder is positional
//! fields separated by single spaces.

mod messages;
mod wire;

pub use messages::{Msg, PeerStatus};
pub use wire::{MessageBuffer, MESSAGE_TERMINATOR};
