//! Error types for the networking core.
//!
//! Every condition that is fatal to a handle or a connection funnels
//! through one of these variants so that `on_disconnect` always carries a
//! human-readable cause.

use std::io;
use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Local socket I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The remote end closed the stream.
    #[error("closed by foreign host")]
    RemoteClosed,

    /// A non-blocking connect finished unsuccessfully.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The proxy reply was not the expected 8 bytes.
    #[error("malformed reply from socks proxy")]
    SocksMalformedReply,

    /// The proxy denied the connection request.
    #[error("socks4a error {status:#04x} while connecting {host}:{port}")]
    SocksRequestDenied {
        /// Status byte from the proxy reply.
        status: u8,
        /// Destination hostname of the denied request.
        host: String,
        /// Destination port of the denied request.
        port: u16,
    },

    /// Protocol violation: the peer sent a message with no command.
    #[error("peer has sent empty message")]
    EmptyMessage,

    /// Protocol violation: a message field could not be parsed.
    #[error("peer has sent malformed message: {0}")]
    MalformedMessage(String),

    /// Read past the end of a message buffer.
    #[error("no more bytes to read")]
    EndOfInput,

    /// A bug on our side surfaced during message dispatch.
    #[error("internal protocol error: {0}")]
    Internal(String),

    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(String),

    /// The reactor was asked to shut down.
    #[error("reactor shut down")]
    ShutDown,

    /// An existing connection was displaced by a newer one for the same peer.
    #[error("replaced by a newer connection")]
    Replaced,

    /// Chat was attempted with a peer whose handshake is not complete.
    #[error("peer {0} is not ready for chat")]
    PeerNotReady(String),
}

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the peer, not us, is at fault for this condition.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::EmptyMessage | Error::MalformedMessage(_))
    }
}
