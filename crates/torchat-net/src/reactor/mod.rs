//! Single-threaded readiness reactor.
//!
//! One [`Reactor`] owns the poll, every registered handle, and a
//! cross-thread task queue. `run` blocks its thread: it waits for
//! readiness, dispatches each ready handle (accept, then connect, then
//! read, then write), and drains the task queue at the end of every cycle.
//! All handler upcalls originate here; no handler may block.
//!
//! Threads other than the reactor thread interact exclusively through a
//! [`ReactorHandle`]: tasks submitted with `invoke_later` run on the
//! reactor thread at the next cycle, and `stop` is safe from anywhere.

mod listener;
mod socks;
mod tcp;

pub use listener::Acceptor;
pub use mio::Token;
pub use tcp::{SockCtx, TcpHandler};

use crate::error::{Error, Result};
use listener::ListenerHandle;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Waker};
use socks::Socks4aShim;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use tcp::{SendBuf, TcpHandle, RECV_BUF_LEN};
use tracing::{debug, error, info, trace, warn};

pub use socks::{build_request as build_socks4a_request, check_reply as check_socks4a_reply};

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(0);

/// First token handed out to handles.
const FIRST_TOKEN: usize = 1;

/// A deferred piece of work executed on the reactor thread.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send>;

enum Registered {
    Tcp(TcpHandle),
    Listener(ListenerHandle),
}

/// Cloneable, thread-safe entry point into a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    tasks: Sender<Task>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
}

impl ReactorHandle {
    /// Run `task` on the reactor thread at the next cycle.
    pub fn invoke_later(&self, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        if self.tasks.send(Box::new(task)).is_err() {
            warn!("task submitted to a reactor that is gone");
            return;
        }
        self.wake();
    }

    /// Ask the reactor to leave its loop. Safe from any thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake();
    }

    /// Force the poll to return so queued work is picked up promptly.
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reactor");
        }
    }
}

/// The readiness multiplexer and owner of all registered handles.
pub struct Reactor {
    poll: Poll,
    handles: HashMap<Token, Registered>,
    next_token: usize,
    tasks: Receiver<Task>,
    shared: ReactorHandle,
}

impl Reactor {
    /// Create a reactor with its waker and task queue.
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (task_tx, task_rx) = channel();
        Ok(Self {
            poll,
            handles: HashMap::new(),
            next_token: FIRST_TOKEN,
            tasks: task_rx,
            shared: ReactorHandle {
                tasks: task_tx,
                waker,
                running: Arc::new(AtomicBool::new(true)),
            },
        })
    }

    /// A cloneable handle for other threads.
    pub fn handle(&self) -> ReactorHandle {
        self.shared.clone()
    }

    /// Submit a task to run at the next cycle.
    pub fn invoke_later(&self, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.shared.invoke_later(task);
    }

    /// Leave the loop after the current cycle. For other threads, use
    /// [`ReactorHandle::stop`].
    pub fn stop(&mut self) {
        self.shared.stop();
    }

    /// Block the calling thread dispatching events until stopped.
    ///
    /// All still-registered handles are closed on the way out.
    pub fn run(&mut self) -> Result<()> {
        self.run_with(|_| {})
    }

    /// Like [`run`](Self::run), additionally invoking `on_cycle` at the end
    /// of every dispatch cycle. Embedders use this to drain their own
    /// wake-assisted command channels on the reactor thread.
    pub fn run_with(&mut self, mut on_cycle: impl FnMut(&mut Reactor)) -> Result<()> {
        let mut events = Events::with_capacity(128);
        while self.shared.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                trace!(
                    token = token.0,
                    readable = event.is_readable(),
                    writable = event.is_writable(),
                    "dispatch"
                );
                match self.handles.get(&token) {
                    Some(Registered::Listener(_)) => self.dispatch_accept(token),
                    Some(Registered::Tcp(_)) => {
                        self.dispatch_tcp(token, event.is_readable(), event.is_writable())
                    }
                    None => {}
                }
            }
            self.drain_tasks();
            on_cycle(self);
        }
        self.close_all();
        Ok(())
    }

    /// Open a listening socket; `acceptor` produces a handler per accepted
    /// connection. Returns the token and the actually bound address.
    pub fn listen(&mut self, addr: SocketAddr, acceptor: Acceptor) -> Result<(Token, SocketAddr)> {
        let mut sock = TcpListener::bind(addr)?;
        let local_addr = sock.local_addr()?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut sock, token, Interest::READABLE)?;
        self.handles.insert(
            token,
            Registered::Listener(ListenerHandle {
                listener: sock,
                acceptor,
            }),
        );
        info!(token = token.0, %local_addr, "listening for incoming connections");
        Ok((token, local_addr))
    }

    /// Initiate a direct outgoing connection. Returns immediately; `send`
    /// may be used before `on_connect` fires, data is queued.
    pub fn connect(&mut self, addr: SocketAddr, handler: Box<dyn TcpHandler>) -> Result<Token> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::WRITABLE)?;
        let mut handle = TcpHandle::new(stream, handler, false);
        handle.interest = Some(Interest::WRITABLE);
        self.handles.insert(token, Registered::Tcp(handle));
        debug!(token = token.0, %addr, "outgoing connect initiated");
        Ok(token)
    }

    /// Initiate an outgoing connection tunneled through a SOCKS4a proxy.
    ///
    /// Behaves exactly like [`connect`](Self::connect) towards the
    /// application, except that the destination hostname is resolved by the
    /// proxy and `on_connect` fires only after the proxy granted the
    /// request.
    pub fn connect_via_socks4a(
        &mut self,
        proxy: SocketAddr,
        dest_host: &str,
        dest_port: u16,
        user_id: &str,
        handler: Box<dyn TcpHandler>,
    ) -> Result<Token> {
        let shim = Socks4aShim::new(dest_host, dest_port, user_id, handler);
        let token = self.connect(proxy, Box::new(shim))?;
        if let Some(handle) = self.tcp_mut(token) {
            handle.in_socks_handshake = true;
        }
        debug!(token = token.0, %dest_host, dest_port, "connecting through socks4a proxy");
        Ok(token)
    }

    /// Queue bytes for sending on `token`, preserving submission order.
    ///
    /// Never blocks. Legal before the connection is established and during
    /// the proxy handshake; in both cases the WRITE subscription is
    /// deferred until the connection is ready for application data.
    pub fn send(&mut self, token: Token, data: Vec<u8>) {
        let Some(handle) = self.tcp_mut(token) else {
            warn!(token = token.0, "send to unknown handle dropped");
            return;
        };
        handle.queue.push_back(SendBuf::new(data));
        let ready = handle.connected && !handle.in_socks_handshake;
        if ready {
            self.update_interest(token);
        }
    }

    /// Close `token` with `cause`: unregister, shut the socket down, drop
    /// queued data, and fire `on_disconnect` exactly once.
    ///
    /// A close requested from inside the handle's own upcall is deferred
    /// until that upcall returns.
    pub fn close(&mut self, token: Token, cause: Error) {
        if let Some(handle) = self.tcp_mut(token) {
            if handle.handler.is_none() {
                if handle.pending_close.is_none() {
                    handle.pending_close = Some(cause);
                }
                return;
            }
        }
        self.finish_close(token, cause);
    }

    /// Close `token` at the end of the current cycle.
    ///
    /// For closing *other* connections from inside an upcall, so their
    /// disconnect handling never reenters the state that requested it.
    pub fn close_later(&mut self, token: Token, cause: Error) {
        self.invoke_later(move |reactor| reactor.close(token, cause));
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            task(self);
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.handles.keys().copied().collect();
        info!(count = tokens.len(), "closing all handles on shutdown");
        for token in tokens {
            self.finish_close(token, Error::ShutDown);
        }
    }

    pub(crate) fn tcp_mut(&mut self, token: Token) -> Option<&mut TcpHandle> {
        match self.handles.get_mut(&token) {
            Some(Registered::Tcp(handle)) => Some(handle),
            _ => None,
        }
    }

    fn tcp(&self, token: Token) -> Option<&TcpHandle> {
        match self.handles.get(&token) {
            Some(Registered::Tcp(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Reconcile the poll subscription with the handle's current state.
    /// All interest mutation goes through here.
    fn update_interest(&mut self, token: Token) {
        let Self { poll, handles, .. } = self;
        let Some(Registered::Tcp(handle)) = handles.get_mut(&token) else {
            return;
        };
        let desired = handle.desired_interest();
        if handle.interest == Some(desired) {
            return;
        }
        match poll
            .registry()
            .reregister(&mut handle.stream, token, desired)
        {
            Ok(()) => handle.interest = Some(desired),
            Err(e) => warn!(token = token.0, error = %e, "failed to update interest"),
        }
    }

    // ---- dispatch -------------------------------------------------------

    fn dispatch_accept(&mut self, token: Token) {
        let Some(Registered::Listener(mut listener)) = self.handles.remove(&token) else {
            return;
        };
        loop {
            match listener.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let handler = (listener.acceptor)(peer_addr);
                    match self.adopt(stream, handler) {
                        Ok(t) => info!(token = t.0, %peer_addr, "accepted incoming connection"),
                        Err(e) => {
                            warn!(%peer_addr, error = %e, "failed to adopt incoming connection")
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(error = %e, "transient accept error");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "listener failed, closing it");
                    let _ = self.poll.registry().deregister(&mut listener.listener);
                    return;
                }
            }
        }
        self.handles.insert(token, Registered::Listener(listener));
    }

    /// Register an already-connected stream. No `on_connect` is fired.
    fn adopt(&mut self, mut stream: TcpStream, handler: Box<dyn TcpHandler>) -> Result<Token> {
        stream.set_nodelay(true)?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;
        let mut handle = TcpHandle::new(stream, handler, true);
        handle.interest = Some(Interest::READABLE);
        self.handles.insert(token, Registered::Tcp(handle));
        Ok(token)
    }

    fn dispatch_tcp(&mut self, token: Token, readable: bool, writable: bool) {
        if writable {
            let connecting = matches!(self.tcp(token), Some(h) if !h.connected);
            if connecting {
                match self.finish_connect(token) {
                    Ok(true) => self.do_event_connect(token),
                    Ok(false) => return,
                    Err(e) => {
                        self.close(token, e);
                        return;
                    }
                }
            }
        }
        if readable {
            if let Err(e) = self.drain_read(token) {
                self.close(token, e);
                return;
            }
        }
        if writable {
            if let Err(e) = self.drain_write(token) {
                self.close(token, e);
            }
        }
    }

    /// Confirm that a pending non-blocking connect actually succeeded.
    fn finish_connect(&mut self, token: Token) -> Result<bool> {
        let Some(handle) = self.tcp_mut(token) else {
            return Ok(false);
        };
        if let Some(e) = handle.stream.take_error()? {
            return Err(Error::ConnectFailed(e.to_string()));
        }
        match handle.stream.peer_addr() {
            Ok(_) => {
                handle.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(Error::ConnectFailed(e.to_string())),
        }
    }

    /// Subscribe the post-connect interest set and fire `on_connect`.
    ///
    /// Also replayed by the proxy shim after a successful handshake; that
    /// replay is what WRITE-subscribes any data queued while the handshake
    /// was in flight.
    fn do_event_connect(&mut self, token: Token) {
        self.update_interest(token);
        let Some(mut handler) = self.take_handler(token) else {
            return;
        };
        let mut ctx = SockCtx {
            reactor: self,
            token,
        };
        handler.on_connect(&mut ctx);
        self.restore_handler(token, handler);
    }

    /// Read 2 KiB chunks until the socket would block, handing each chunk
    /// to the installed handler. Zero bytes read means the remote closed.
    fn drain_read(&mut self, token: Token) -> Result<()> {
        loop {
            let chunk = {
                let Some(handle) = self.tcp_mut(token) else {
                    return Ok(());
                };
                if !handle.connected {
                    return Ok(());
                }
                let mut buf = [0u8; RECV_BUF_LEN];
                match handle.stream.read(&mut buf) {
                    Ok(0) => return Err(Error::RemoteClosed),
                    Ok(n) => buf[..n].to_vec(),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            self.fire_receive(token, &chunk);
            if self.tcp(token).is_none() {
                // Closed from inside the upcall.
                return Ok(());
            }
        }
    }

    /// Write queued buffers head-first until the queue is empty or the
    /// socket is congested, then reconcile the WRITE subscription.
    fn drain_write(&mut self, token: Token) -> Result<()> {
        {
            let Some(handle) = self.tcp_mut(token) else {
                return Ok(());
            };
            if !handle.connected || handle.in_socks_handshake {
                return Ok(());
            }
            loop {
                let Some(head) = handle.queue.front_mut() else {
                    break;
                };
                if head.is_done() {
                    handle.queue.pop_front();
                    continue;
                }
                match handle.stream.write(head.remaining()) {
                    Ok(0) => {
                        return Err(std::io::Error::from(ErrorKind::WriteZero).into());
                    }
                    Ok(n) => {
                        head.advance(n);
                        if head.is_done() {
                            handle.queue.pop_front();
                        } else {
                            // Partial write: the socket is congested, the
                            // rest waits for the next writable event.
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.update_interest(token);
        Ok(())
    }

    fn fire_receive(&mut self, token: Token, data: &[u8]) {
        let Some(mut handler) = self.take_handler(token) else {
            return;
        };
        let mut ctx = SockCtx {
            reactor: self,
            token,
        };
        handler.on_receive(&mut ctx, data);
        self.restore_handler(token, handler);
    }

    fn take_handler(&mut self, token: Token) -> Option<Box<dyn TcpHandler>> {
        self.tcp_mut(token).and_then(|h| h.handler.take())
    }

    /// Put a handler back after an upcall, then apply whatever the upcall
    /// requested: a deferred close wins over a pending shim promotion.
    fn restore_handler(&mut self, token: Token, handler: Box<dyn TcpHandler>) {
        let pending_close = match self.tcp_mut(token) {
            Some(handle) => {
                handle.handler = Some(handler);
                handle.pending_close.take()
            }
            None => None,
        };
        if let Some(cause) = pending_close {
            self.finish_close(token, cause);
        } else {
            self.apply_promotion(token);
        }
    }

    /// Swap the proxy shim for the application handler and replay the
    /// connect event. Happens at most once per handle.
    fn apply_promotion(&mut self, token: Token) {
        let Some(handle) = self.tcp_mut(token) else {
            return;
        };
        let Some(app) = handle.promoted.take() else {
            return;
        };
        handle.handler = Some(app);
        handle.in_socks_handshake = false;
        self.do_event_connect(token);
    }

    fn finish_close(&mut self, token: Token, cause: Error) {
        let Some(entry) = self.handles.remove(&token) else {
            return;
        };
        match entry {
            Registered::Tcp(mut handle) => {
                debug!(token = token.0, cause = %cause, "closing connection");
                if let Err(e) = self.poll.registry().deregister(&mut handle.stream) {
                    debug!(token = token.0, error = %e, "deregister failed");
                }
                let _ = handle.stream.shutdown(Shutdown::Both);
                handle.queue.clear();
                if let Some(mut handler) = handle.handler.take() {
                    handler.on_disconnect(self, token, cause);
                }
            }
            Registered::Listener(mut listener) => {
                debug!(token = token.0, cause = %cause, "closing listener");
                if let Err(e) = self.poll.registry().deregister(&mut listener.listener) {
                    debug!(token = token.0, error = %e, "deregister failed");
                }
            }
        }
    }
}
