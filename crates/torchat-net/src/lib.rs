//! # torchat-net
//!
//! Networking and protocol core of a peer-to-peer chat client that talks
//! exclusively through an anonymizing SOCKS4a proxy (typically a Tor
//! client on loopback). Peers are identified by opaque onion addresses and
//! exchange short, line-delimited text commands over bidirectional TCP.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             application / CLI            │
//! ├──────────────────────────────────────────┤
//! │   chat (client, peers, connections)      │
//! ├──────────────────────────────────────────┤
//! │   protocol (framing codec, messages)     │
//! ├──────────────────────────────────────────┤
//! │   reactor (poll, tcp, listener, socks)   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one reactor thread. Other threads reach the core
//! only through [`reactor::ReactorHandle`] tasks and the wake-assisted
//! command channel of [`chat::ClientHandle`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod chat;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod protocol;
pub mod reactor;

pub use chat::{ChatEvent, Client, ClientHandle};
pub use config::Config;
pub use error::{Error, Result};
pub use identity::OnionAddress;

/// Library version, announced to peers in the `version` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
