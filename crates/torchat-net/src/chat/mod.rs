//! Chat layer: connections, peers, and the client that drives the
//! dual-connection handshake.

mod client;
mod connection;
mod peer;

pub use client::{ChatEvent, Client, ClientHandle};
pub use connection::{Connection, ConnectionKind};
pub use peer::Peer;
