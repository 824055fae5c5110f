//! Listening socket registered with the reactor.

use super::tcp::TcpHandler;
use mio::net::TcpListener;
use std::net::SocketAddr;

/// Factory invoked once per accepted connection to produce its handler.
///
/// Accepted handles are adopted as already connected; no `on_connect` is
/// fired for them, the factory result simply starts receiving.
pub type Acceptor = Box<dyn FnMut(SocketAddr) -> Box<dyn TcpHandler>>;

/// Reactor-side state of one listening socket.
pub(super) struct ListenerHandle {
    pub(super) listener: TcpListener,
    pub(super) acceptor: Acceptor,
}
