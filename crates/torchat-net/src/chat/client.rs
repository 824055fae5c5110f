//! The client: peer registry and handshake driver.
//!
//! Owns the listener and the per-peer records, reacts to parsed protocol
//! messages, and reports peer events to the embedding application over a
//! channel. Lives on the reactor thread behind an `Rc<RefCell>`; other
//! threads talk to it through a [`ClientHandle`].

use super::connection::{Connection, ConnectionKind};
use super::peer::Peer;
use crate::config::{Config, DEFAULT_PROTOCOL_PORT};
use crate::error::{Error, Result};
use crate::identity::{generate_nonce, OnionAddress};
use crate::logging::ShortOnion;
use crate::protocol::{Msg, PeerStatus};
use crate::reactor::{Reactor, ReactorHandle, SockCtx, Token};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::mpsc::{channel, Receiver, Sender};
use tracing::{debug, info, warn};

/// Peer events reported to the embedding application.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// The dual-connection handshake with a peer completed.
    ChatEstablished {
        /// The peer's address.
        onion: OnionAddress,
    },
    /// A chat message arrived.
    Message {
        /// The sending peer.
        onion: OnionAddress,
        /// Message body; may contain newlines.
        text: String,
    },
    /// A peer announced its availability.
    Status {
        /// The announcing peer.
        onion: OnionAddress,
        /// The announced state.
        status: PeerStatus,
    },
    /// One of a peer's connections went away.
    ConnectionLost {
        /// The affected peer.
        onion: OnionAddress,
        /// Human-readable cause.
        reason: String,
    },
}

/// Commands other threads may submit through a [`ClientHandle`].
enum ClientCommand {
    SendChat { onion: OnionAddress, text: String },
}

/// Thread-safe handle to a client running on its reactor thread.
#[derive(Clone)]
pub struct ClientHandle {
    commands: Sender<ClientCommand>,
    reactor: ReactorHandle,
}

impl ClientHandle {
    /// Queue a chat message for `onion`; delivered on the reactor thread
    /// at the next cycle.
    pub fn send_chat(&self, onion: OnionAddress, text: String) {
        if self
            .commands
            .send(ClientCommand::SendChat { onion, text })
            .is_err()
        {
            warn!("chat command submitted to a client that is gone");
            return;
        }
        self.reactor.wake();
    }

    /// Stop the reactor the client runs on.
    pub fn stop(&self) {
        self.reactor.stop();
    }
}

/// Peer registry and protocol brain of one chat identity.
pub struct Client {
    onion: OnionAddress,
    /// Fresh random string per process start; peers echo it in `pong`.
    nonce: String,
    proxy_addr: SocketAddr,
    proxy_user_id: String,
    peers: HashMap<OnionAddress, Peer>,
    events: Sender<ChatEvent>,
    commands: Receiver<ClientCommand>,
    /// Back-reference handed to every connection handler we create.
    self_ref: Weak<RefCell<Client>>,
    local_addr: Option<SocketAddr>,
}

impl Client {
    /// Validate the configuration, bind the listener, and wire the client
    /// into `reactor`. Returns the shared client plus a cross-thread handle.
    pub fn start(
        reactor: &mut Reactor,
        config: Config,
        events: Sender<ChatEvent>,
    ) -> Result<(Rc<RefCell<Client>>, ClientHandle)> {
        config.validate()?;
        let proxy_addr = config.proxy.socket_addr()?;
        let listen_addr = config.listen_addr()?;
        let (command_tx, command_rx) = channel();

        let client = Rc::new(RefCell::new(Client {
            onion: config.onion.clone(),
            nonce: generate_nonce(),
            proxy_addr,
            proxy_user_id: config.proxy.user_id.clone(),
            peers: HashMap::new(),
            events,
            commands: command_rx,
            self_ref: Weak::new(),
            local_addr: None,
        }));
        client.borrow_mut().self_ref = Rc::downgrade(&client);

        let acceptor_client = Rc::clone(&client);
        let (_token, local_addr) = reactor.listen(
            listen_addr,
            Box::new(move |peer_addr| {
                debug!(%peer_addr, "peer dialed in");
                Box::new(Connection::incoming(Rc::clone(&acceptor_client)))
            }),
        )?;
        client.borrow_mut().local_addr = Some(local_addr);

        info!(onion = %ShortOnion(&config.onion), %local_addr, "client started");
        let handle = ClientHandle {
            commands: command_tx,
            reactor: reactor.handle(),
        };
        Ok((client, handle))
    }

    /// Our own onion address.
    pub fn onion(&self) -> &OnionAddress {
        &self.onion
    }

    /// The address the listener actually bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The peer record for `onion`, if one exists.
    pub fn peer(&self, onion: &OnionAddress) -> Option<&Peer> {
        self.peers.get(onion)
    }

    /// Drain commands submitted through [`ClientHandle`]s.
    ///
    /// Must run on the reactor thread; embedders call this from the
    /// reactor's per-cycle hook.
    pub fn drain_commands(&mut self, reactor: &mut Reactor) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ClientCommand::SendChat { onion, text } => {
                    if let Err(e) = self.send_chat(reactor, &onion, &text) {
                        warn!(peer = %ShortOnion(&onion), error = %e, "chat message dropped");
                    }
                }
            }
        }
    }

    /// Send a chat message to a peer that completed the handshake.
    pub fn send_chat(&mut self, reactor: &mut Reactor, onion: &OnionAddress, text: &str) -> Result<()> {
        let peer = self
            .peers
            .get(onion)
            .filter(|p| p.is_ready_for_chat())
            .ok_or_else(|| Error::PeerNotReady(onion.to_string()))?;
        let token = peer
            .outgoing
            .ok_or_else(|| Error::PeerNotReady(onion.to_string()))?;
        reactor.send(
            token,
            Msg::Chat(text.to_owned()).to_buffer().encode_for_sending(),
        );
        Ok(())
    }

    /// A ping arrived on `kind` from `onion`.
    ///
    /// Locates or creates the peer record, claims the incoming slot, makes
    /// sure an outgoing connection exists, and answers on it: a fresh
    /// outgoing gets our own ping first, then pong, status and version
    /// follow in order. All sends are queued; they flush once the proxy
    /// handshake of the outgoing connection completes.
    pub(crate) fn handle_ping(
        &mut self,
        sock: &mut SockCtx<'_>,
        kind: ConnectionKind,
        onion: OnionAddress,
        nonce: String,
    ) {
        info!(peer = %ShortOnion(&onion), kind = %kind, "ping received");
        let conn_token = sock.token();

        let (displaced, existing_outgoing) = {
            let peer = self.peers.entry(onion.clone()).or_insert_with(Peer::new);
            let mut displaced = None;
            if kind == ConnectionKind::Incoming && peer.incoming != Some(conn_token) {
                displaced = peer.incoming.replace(conn_token);
            }
            (displaced, peer.outgoing)
        };
        if let Some(old) = displaced {
            // The slot held another connection; it must not leak.
            info!(token = old.0, peer = %ShortOnion(&onion), "closing displaced incoming connection");
            sock.reactor().close_later(old, Error::Replaced);
        }

        let outgoing = match existing_outgoing {
            Some(token) => token,
            None => match self.open_outgoing(sock.reactor(), &onion) {
                Some(token) => {
                    // Introduce ourselves before answering.
                    let ping = Msg::Ping {
                        onion: self.onion.clone(),
                        nonce: self.nonce.clone(),
                    };
                    sock.reactor()
                        .send(token, ping.to_buffer().encode_for_sending());
                    token
                }
                None => return,
            },
        };

        for msg in [
            Msg::Pong { nonce },
            Msg::Status(PeerStatus::Available),
            Msg::Version(crate::VERSION.to_owned()),
        ] {
            sock.reactor()
                .send(outgoing, msg.to_buffer().encode_for_sending());
        }
    }

    fn open_outgoing(&mut self, reactor: &mut Reactor, onion: &OnionAddress) -> Option<Token> {
        let client = self.self_ref.upgrade()?;
        let handler = Box::new(Connection::outgoing(client, onion.clone()));
        match reactor.connect_via_socks4a(
            self.proxy_addr,
            &onion.hostname(),
            DEFAULT_PROTOCOL_PORT,
            &self.proxy_user_id,
            handler,
        ) {
            Ok(token) => {
                info!(token = token.0, peer = %ShortOnion(onion), "opening outgoing connection");
                if let Some(peer) = self.peers.get_mut(onion) {
                    peer.outgoing = Some(token);
                }
                Some(token)
            }
            Err(e) => {
                warn!(peer = %ShortOnion(onion), error = %e, "failed to open outgoing connection");
                None
            }
        }
    }

    /// A pong arrived. Only a pong echoing our current nonce counts.
    pub(crate) fn handle_pong(&mut self, peer_onion: Option<OnionAddress>, nonce: String) {
        let Some(onion) = peer_onion else {
            warn!("pong on a connection with no known peer");
            return;
        };
        if nonce != self.nonce {
            warn!(peer = %ShortOnion(&onion), "pong with foreign nonce ignored");
            return;
        }
        let Some(peer) = self.peers.get_mut(&onion) else {
            warn!(peer = %ShortOnion(&onion), "pong from a peer we never pinged");
            return;
        };
        if !peer.handshake_complete {
            peer.handshake_complete = true;
            info!(peer = %ShortOnion(&onion), "chat established");
            let _ = self.events.send(ChatEvent::ChatEstablished { onion });
        }
    }

    pub(crate) fn handle_status(&mut self, peer_onion: Option<OnionAddress>, status: PeerStatus) {
        let Some(onion) = peer_onion else {
            warn!("status on a connection with no known peer");
            return;
        };
        if let Some(peer) = self.peers.get_mut(&onion) {
            peer.status = Some(status);
        }
        let _ = self.events.send(ChatEvent::Status { onion, status });
    }

    pub(crate) fn handle_version(&mut self, peer_onion: Option<OnionAddress>, version: String) {
        let Some(onion) = peer_onion else {
            warn!("version on a connection with no known peer");
            return;
        };
        debug!(peer = %ShortOnion(&onion), version, "peer version");
        if let Some(peer) = self.peers.get_mut(&onion) {
            peer.version = Some(version);
        }
    }

    pub(crate) fn handle_chat(&mut self, peer_onion: Option<OnionAddress>, text: String) {
        let Some(onion) = peer_onion else {
            warn!("chat message on a connection with no known peer, dropped");
            return;
        };
        let _ = self.events.send(ChatEvent::Message { onion, text });
    }

    /// Forget a closed connection wherever a peer record references it.
    pub(crate) fn connection_lost(
        &mut self,
        token: Token,
        peer_onion: Option<OnionAddress>,
        cause: &Error,
    ) {
        let Some(onion) = peer_onion else { return };
        let Some(peer) = self.peers.get_mut(&onion) else {
            return;
        };
        let mut changed = false;
        if peer.incoming == Some(token) {
            peer.incoming = None;
            changed = true;
        }
        if peer.outgoing == Some(token) {
            peer.outgoing = None;
            changed = true;
        }
        if changed {
            let _ = self.events.send(ChatEvent::ConnectionLost {
                onion,
                reason: cause.to_string(),
            });
        }
    }
}
