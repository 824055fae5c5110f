//! One protocol connection: frame reassembly and typed dispatch.
//!
//! A peer is always represented by two of these, one per direction. The
//! connection reassembles terminator-delimited frames across arbitrary
//! read boundaries, decodes and parses each one, and hands the typed
//! message to the client.

use super::client::Client;
use crate::error::Error;
use crate::protocol::{Msg, MessageBuffer, MESSAGE_TERMINATOR};
use crate::reactor::{Reactor, SockCtx, TcpHandler, Token};
use crate::identity::OnionAddress;
use crate::logging::ShortOnion;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Process-wide connection numbering for log correlation.
static NEXT_CONNECTION_NUMBER: AtomicU64 = AtomicU64::new(0);

/// Direction of a connection relative to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// The peer dialed our onion service.
    Incoming,
    /// We dialed the peer's onion service through the proxy.
    Outgoing,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => f.write_str("incoming"),
            Self::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Splits a byte stream at message terminators.
///
/// The tail after the last terminator is carried over to the next push;
/// it never contains a terminator byte itself.
#[derive(Debug, Default)]
pub(crate) struct FrameAssembler {
    incomplete: Vec<u8>,
}

impl FrameAssembler {
    /// Feed a chunk, returning every completed frame in order.
    ///
    /// Frames are returned with the terminator stripped. An empty frame
    /// (two adjacent terminators, or a terminator with nothing before it)
    /// is returned as an empty vec; deciding its fate is the caller's job.
    pub(crate) fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut buf = std::mem::take(&mut self.incomplete);
        buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut start = 0;
        for (i, &b) in buf.iter().enumerate() {
            if b == MESSAGE_TERMINATOR {
                frames.push(buf[start..i].to_vec());
                start = i + 1;
            }
        }
        self.incomplete = buf[start..].to_vec();
        frames
    }

    #[cfg(test)]
    fn incomplete(&self) -> &[u8] {
        &self.incomplete
    }
}

/// Handler for one established protocol connection.
pub struct Connection {
    number: u64,
    kind: ConnectionKind,
    assembler: FrameAssembler,
    /// Learned from the first ping on incoming connections; known from
    /// construction on outgoing ones.
    peer_onion: Option<OnionAddress>,
    client: Rc<RefCell<Client>>,
}

impl Connection {
    /// Handler for a connection accepted by our listener. The peer is
    /// unknown until its first ping.
    pub fn incoming(client: Rc<RefCell<Client>>) -> Self {
        Self::new(ConnectionKind::Incoming, None, client)
    }

    /// Handler for a connection we dial to a known peer.
    pub fn outgoing(client: Rc<RefCell<Client>>, onion: OnionAddress) -> Self {
        Self::new(ConnectionKind::Outgoing, Some(onion), client)
    }

    fn new(
        kind: ConnectionKind,
        peer_onion: Option<OnionAddress>,
        client: Rc<RefCell<Client>>,
    ) -> Self {
        Self {
            number: NEXT_CONNECTION_NUMBER.fetch_add(1, Ordering::Relaxed),
            kind,
            assembler: FrameAssembler::default(),
            peer_onion,
            client,
        }
    }

    /// Parse and execute one complete frame. Returns false when the
    /// connection was closed and remaining frames must not be processed.
    fn handle_frame(&mut self, sock: &mut SockCtx<'_>, frame: &[u8]) -> bool {
        let mut buf = MessageBuffer::from_received(frame);
        match Msg::parse(&mut buf) {
            Ok(msg) => {
                self.execute(sock, msg);
                true
            }
            Err(Error::EndOfInput) => {
                sock.close(Error::EmptyMessage);
                false
            }
            Err(e @ Error::MalformedMessage(_)) => {
                sock.close(e);
                false
            }
            Err(e) => {
                // Not the peer's fault; this is a bug on our side.
                sock.close(Error::Internal(e.to_string()));
                false
            }
        }
    }

    fn execute(&mut self, sock: &mut SockCtx<'_>, msg: Msg) {
        match msg {
            Msg::Ping { onion, nonce } => {
                self.peer_onion = Some(onion.clone());
                self.client
                    .borrow_mut()
                    .handle_ping(sock, self.kind, onion, nonce);
            }
            Msg::Pong { nonce } => {
                self.client
                    .borrow_mut()
                    .handle_pong(self.peer_onion.clone(), nonce);
            }
            Msg::Status(status) => {
                self.client
                    .borrow_mut()
                    .handle_status(self.peer_onion.clone(), status);
            }
            Msg::Version(version) => {
                self.client
                    .borrow_mut()
                    .handle_version(self.peer_onion.clone(), version);
            }
            Msg::Chat(text) => {
                self.client
                    .borrow_mut()
                    .handle_chat(self.peer_onion.clone(), text);
            }
            Msg::NotImplemented { command } => {
                debug!(
                    number = self.number,
                    command, "peer does not implement a command we sent"
                );
            }
            Msg::Unknown { command } => {
                warn!(number = self.number, command, "unknown command");
                let reply = Msg::Unknown { command };
                sock.send(reply.to_buffer().encode_for_sending());
            }
        }
    }
}

impl TcpHandler for Connection {
    fn on_connect(&mut self, sock: &mut SockCtx<'_>) {
        info!(
            number = self.number,
            kind = %self.kind,
            token = sock.token().0,
            "connection established"
        );
    }

    fn on_disconnect(&mut self, _reactor: &mut Reactor, token: Token, cause: Error) {
        match &self.peer_onion {
            Some(onion) => info!(
                number = self.number,
                kind = %self.kind,
                peer = %ShortOnion(onion),
                cause = %cause,
                "connection lost"
            ),
            None => info!(number = self.number, kind = %self.kind, cause = %cause, "connection lost"),
        }
        self.client
            .borrow_mut()
            .connection_lost(token, self.peer_onion.clone(), &cause);
    }

    fn on_receive(&mut self, sock: &mut SockCtx<'_>, data: &[u8]) {
        for frame in self.assembler.push(data) {
            if !self.handle_frame(sock, &frame) {
                return;
            }
        }
    }
}
