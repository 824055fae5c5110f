//! Non-blocking TCP connection state and the application callback surface.
//!
//! A [`TcpHandle`] wraps a `mio` stream together with its ordered outbound
//! queue. The application receives events through a [`TcpHandler`]; every
//! upcall originates on the reactor thread and carries a [`SockCtx`] through
//! which the handler can send, close, or reach the reactor itself.

use super::Reactor;
use crate::error::{Error, Result};
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::collections::VecDeque;
use std::io::{ErrorKind, Write};

/// Size of the scratch buffer used for every single read.
pub(super) const RECV_BUF_LEN: usize = 2048;

/// Event callbacks of a TCP connection.
///
/// This is a capability set, not a class hierarchy: anything registered for
/// a connection gets exactly these three upcalls. The proxy handshake shim
/// implements the same trait and decorates the application's handler until
/// the handshake completes.
pub trait TcpHandler {
    /// The connection is established and ready for traffic.
    fn on_connect(&mut self, sock: &mut SockCtx<'_>);

    /// The connection is gone; fired exactly once with the closing cause.
    fn on_disconnect(&mut self, reactor: &mut Reactor, token: Token, cause: Error);

    /// A chunk of bytes arrived. Chunk boundaries carry no meaning.
    fn on_receive(&mut self, sock: &mut SockCtx<'_>, data: &[u8]);
}

/// One buffer in the outbound queue.
///
/// Only the queue head is ever partially consumed; its read position
/// advances monotonically until the buffer is drained.
#[derive(Debug)]
pub(super) struct SendBuf {
    data: Vec<u8>,
    pos: usize,
}

impl SendBuf {
    pub(super) fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub(super) fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(super) fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    pub(super) fn is_done(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// Reactor-side state of one TCP connection.
pub(super) struct TcpHandle {
    pub(super) stream: TcpStream,
    /// Installed callback. Taken out for the duration of each upcall.
    pub(super) handler: Option<Box<dyn TcpHandler>>,
    /// Outbound FIFO, strictly in `send` call order.
    pub(super) queue: VecDeque<SendBuf>,
    /// What the poll has last been told about this stream.
    pub(super) interest: Option<Interest>,
    pub(super) connected: bool,
    /// While true the queue is frozen and WRITE is never subscribed.
    pub(super) in_socks_handshake: bool,
    /// Close requested from inside this handle's own upcall.
    pub(super) pending_close: Option<Error>,
    /// Application handler waiting to replace the proxy shim.
    pub(super) promoted: Option<Box<dyn TcpHandler>>,
}

impl TcpHandle {
    pub(super) fn new(stream: TcpStream, handler: Box<dyn TcpHandler>, connected: bool) -> Self {
        Self {
            stream,
            handler: Some(handler),
            queue: VecDeque::new(),
            interest: None,
            connected,
            in_socks_handshake: false,
            pending_close: None,
            promoted: None,
        }
    }

    /// Interest the poll should hold for the current state.
    ///
    /// Before the connect finishes only writability matters (that is how
    /// completion is reported). Afterwards WRITE is subscribed iff there is
    /// queued data and the proxy handshake is not in progress.
    pub(super) fn desired_interest(&self) -> Interest {
        if !self.connected {
            Interest::WRITABLE
        } else if !self.queue.is_empty() && !self.in_socks_handshake {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }
}

/// Dispatch context handed to every [`TcpHandler`] upcall.
///
/// Borrows the reactor, so handlers can operate on their own connection as
/// well as open, write to, or close other connections.
pub struct SockCtx<'a> {
    pub(super) reactor: &'a mut Reactor,
    pub(super) token: Token,
}

impl SockCtx<'_> {
    /// Registration token of the connection this upcall belongs to.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Queue bytes for sending on this connection. Never blocks.
    pub fn send(&mut self, data: Vec<u8>) {
        self.reactor.send(self.token, data);
    }

    /// Close this connection. When called from inside the connection's own
    /// upcall the close is deferred until the upcall returns.
    pub fn close(&mut self, cause: Error) {
        self.reactor.close(self.token, cause);
    }

    /// The reactor, for operations on other handles.
    pub fn reactor(&mut self) -> &mut Reactor {
        self.reactor
    }

    /// Synchronous write that bypasses the outbound queue.
    ///
    /// Used only by the proxy handshake: the request must hit the socket as
    /// one contiguous run before any queued application data. The spin on
    /// `WouldBlock` is bounded in practice because the request is a few
    /// dozen bytes on a freshly established socket.
    pub(crate) fn send_now(&mut self, data: &[u8]) -> Result<()> {
        let handle = self
            .reactor
            .tcp_mut(self.token)
            .ok_or_else(|| Error::Internal("send_now on a closed handle".into()))?;
        let mut pos = 0;
        while pos < data.len() {
            match handle.stream.write(&data[pos..]) {
                Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => pos += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Hand control of this connection over to `app` once the current
    /// upcall returns: the shim is dropped, the queue thaws, and a connect
    /// event is replayed so the new handler sees `on_connect`.
    pub(crate) fn promote(&mut self, app: Box<dyn TcpHandler>) {
        if let Some(handle) = self.reactor.tcp_mut(self.token) {
            handle.promoted = Some(app);
        }
    }
}
