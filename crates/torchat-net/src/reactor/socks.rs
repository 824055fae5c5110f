//! SOCKS4a client handshake.
//!
//! The shim sits in front of the application's [`TcpHandler`] on outgoing
//! connections. It speaks to the proxy during connect, and once the proxy
//! grants the request it swaps itself out for the saved application
//! handler, exactly once, leaving the tunnel indistinguishable from a
//! direct connection.

use super::tcp::{SockCtx, TcpHandler};
use super::{Reactor, Token};
use crate::error::{Error, Result};
use tracing::{debug, warn};

/// SOCKS protocol version byte.
const SOCKS_VERSION: u8 = 0x04;

/// CONNECT command byte.
const CMD_CONNECT: u8 = 0x01;

/// Status byte: request granted.
const REPLY_GRANTED: u8 = 0x5A;

/// Fixed length of a SOCKS4 reply.
const REPLY_LEN: usize = 8;

/// Build a SOCKS4a CONNECT request.
///
/// The deliberately invalid IP `0.0.0.1` tells the proxy to resolve the
/// hostname itself (the 4a variant); both the user id and the hostname are
/// null-terminated.
pub fn build_request(host: &str, port: u16, user_id: &str) -> Vec<u8> {
    let mut req = Vec::with_capacity(10 + user_id.len() + host.len());
    req.push(SOCKS_VERSION);
    req.push(CMD_CONNECT);
    req.extend_from_slice(&port.to_be_bytes());
    req.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    req.extend_from_slice(user_id.as_bytes());
    req.push(0x00);
    req.extend_from_slice(host.as_bytes());
    req.push(0x00);
    req
}

/// Check an 8-byte proxy reply against the destination it was for.
pub fn check_reply(reply: &[u8], host: &str, port: u16) -> Result<()> {
    if reply.len() != REPLY_LEN {
        return Err(Error::SocksMalformedReply);
    }
    let status = reply[1];
    if status != REPLY_GRANTED {
        return Err(Error::SocksRequestDenied {
            status,
            host: host.to_owned(),
            port,
        });
    }
    Ok(())
}

/// Transient handler installed for the duration of the proxy handshake.
pub(super) struct Socks4aShim {
    host: String,
    port: u16,
    user_id: String,
    /// The application's handler, handed over on success.
    application: Option<Box<dyn TcpHandler>>,
}

impl Socks4aShim {
    pub(super) fn new(
        host: &str,
        port: u16,
        user_id: &str,
        application: Box<dyn TcpHandler>,
    ) -> Self {
        Self {
            host: host.to_owned(),
            port,
            user_id: user_id.to_owned(),
            application: Some(application),
        }
    }
}

impl TcpHandler for Socks4aShim {
    fn on_connect(&mut self, sock: &mut SockCtx<'_>) {
        // Connected to the proxy, not to the destination yet. The request
        // bypasses the queue so it cannot interleave with application data
        // queued before the handshake finished.
        debug!(host = %self.host, port = self.port, "sending socks4a request");
        let request = build_request(&self.host, self.port, &self.user_id);
        if let Err(e) = sock.send_now(&request) {
            sock.close(e);
        }
    }

    fn on_disconnect(&mut self, reactor: &mut Reactor, token: Token, cause: Error) {
        // Handshake never finished; the application hears the original cause.
        match self.application.take() {
            Some(mut app) => app.on_disconnect(reactor, token, cause),
            None => warn!(host = %self.host, "proxy shim lost its application handler"),
        }
    }

    fn on_receive(&mut self, sock: &mut SockCtx<'_>, data: &[u8]) {
        if let Err(e) = check_reply(data, &self.host, self.port) {
            sock.close(e);
            return;
        }
        debug!(host = %self.host, port = self.port, "socks4a tunnel established");
        match self.application.take() {
            Some(app) => sock.promote(app),
            None => sock.close(Error::Internal(
                "proxy reply arrived twice on the same handshake".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let req = build_request("abcdefghijklmnop.onion", 11009, "TorChat");
        let expected: &[u8] = &[
            0x04, 0x01, 0x2B, 0x01, 0x00, 0x00, 0x00, 0x01, b'T', b'o', b'r', b'C', b'h', b'a',
            b't', 0x00, b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', b'k', b'l',
            b'm', b'n', b'o', b'p', b'.', b'o', b'n', b'i', b'o', b'n', 0x00,
        ];
        assert_eq!(req, expected);
    }

    #[test]
    fn test_reply_granted() {
        let reply = [0x00, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert!(check_reply(&reply, "host.onion", 11009).is_ok());
    }

    #[test]
    fn test_reply_denied_carries_status_and_destination() {
        let reply = [0x00, 0x5B, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        match check_reply(&reply, "host.onion", 11009) {
            Err(Error::SocksRequestDenied { status, host, port }) => {
                assert_eq!(status, 0x5B);
                assert_eq!(host, "host.onion");
                assert_eq!(port, 11009);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_reply_wrong_length() {
        assert!(matches!(
            check_reply(&[0x00, 0x5A, 0x00], "h", 1),
            Err(Error::SocksMalformedReply)
        ));
        assert!(matches!(
            check_reply(&[0; 9], "h", 1),
            Err(Error::SocksMalformedReply)
        ));
    }
}
