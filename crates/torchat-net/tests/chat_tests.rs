//! End-to-end tests of framing, dispatch, and the dual-connection
//! handshake, driving a real client against scripted peers and a scripted
//! SOCKS proxy.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver};
use std::thread;
use std::time::Duration;

use torchat_net::chat::{ChatEvent, Client, ClientHandle};
use torchat_net::reactor::Reactor;
use torchat_net::{Config, OnionAddress};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Our test identity.
const OWN_ONION: &str = "bbbbbbbbbbbbbbbb";

/// Start a client on its own reactor thread, listening on an ephemeral
/// port, with all outgoing connections pointed at `proxy_addr`.
fn start_client(
    proxy_addr: SocketAddr,
) -> (
    ClientHandle,
    Receiver<ChatEvent>,
    SocketAddr,
    thread::JoinHandle<()>,
) {
    let mut config = Config::new(OnionAddress::from_string(OWN_ONION).expect("own onion"));
    config.listen_port = 0;
    config.proxy.host = proxy_addr.ip().to_string();
    config.proxy.port = proxy_addr.port();

    let (event_tx, event_rx) = channel();
    let (ready_tx, ready_rx) = channel();
    let join = thread::spawn(move || {
        let mut reactor = Reactor::new().expect("create reactor");
        let (client, handle) = Client::start(&mut reactor, config, event_tx).expect("start client");
        let local_addr = client.borrow().local_addr().expect("listener address");
        ready_tx.send((handle, local_addr)).expect("publish client");
        reactor
            .run_with(move |r| client.borrow_mut().drain_commands(r))
            .expect("run reactor");
    });
    let (handle, local_addr) = ready_rx.recv_timeout(TIMEOUT).expect("client ready");
    (handle, event_rx, local_addr, join)
}

/// Read and verify one SOCKS4a request, returning (port, user-id, host).
fn read_socks_request(conn: &mut TcpStream) -> (u16, String, String) {
    let mut header = [0u8; 8];
    conn.read_exact(&mut header).expect("socks header");
    assert_eq!(header[0], 0x04, "socks version");
    assert_eq!(header[1], 0x01, "connect command");
    let port = u16::from_be_bytes([header[2], header[3]]);
    assert_eq!(&header[4..8], &[0x00, 0x00, 0x00, 0x01], "4a marker ip");

    let mut fields: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();
    while fields.len() < 2 {
        let mut b = [0u8; 1];
        conn.read_exact(&mut b).expect("socks request byte");
        if b[0] == 0x00 {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(b[0]);
        }
    }
    let user = String::from_utf8(fields[0].clone()).expect("user id utf-8");
    let host = String::from_utf8(fields[1].clone()).expect("host utf-8");
    (port, user, host)
}

/// A peer sends a ping and a chat message; the client must surface the
/// parsed message regardless of how the bytes were fragmented.
fn expect_chat_message(write: impl FnOnce(&mut TcpStream)) {
    // The proxy accepts connects into its backlog but never answers, so
    // the client's outgoing attempt just idles during the test.
    let proxy = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let (handle, events, listen_addr, join) = start_client(proxy.local_addr().expect("addr"));

    let mut peer = TcpStream::connect(listen_addr).expect("dial client");
    write(&mut peer);

    match events.recv_timeout(TIMEOUT).expect("chat event") {
        ChatEvent::Message { onion, text } => {
            assert_eq!(onion.as_str(), "abc");
            assert_eq!(text, "hello\nworld");
        }
        other => panic!("expected chat message, got {other:?}"),
    }

    handle.stop();
    join.join().expect("join reactor");
}

#[test]
fn test_framing_single_write() {
    // The body carries a literal backslash-n, decoding to a newline.
    expect_chat_message(|peer| {
        peer.write_all(b"ping abc xyz\nmessage hello\\nworld\n")
            .expect("write");
    });
}

#[test]
fn test_framing_one_byte_at_a_time() {
    expect_chat_message(|peer| {
        for &b in b"ping abc xyz\nmessage hello\\nworld\n" {
            peer.write_all(&[b]).expect("write byte");
            peer.flush().expect("flush");
            thread::sleep(Duration::from_millis(1));
        }
    });
}

#[test]
fn test_empty_message_closes_connection() {
    let proxy = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let (handle, events, listen_addr, join) = start_client(proxy.local_addr().expect("addr"));

    let mut peer = TcpStream::connect(listen_addr).expect("dial client");
    peer.set_read_timeout(Some(TIMEOUT)).expect("timeout");
    // The ping claims the connection for peer "abc"; the bare terminator
    // that follows is an empty message.
    peer.write_all(b"ping abc xyz\n\n").expect("write");

    match events.recv_timeout(TIMEOUT).expect("event") {
        ChatEvent::ConnectionLost { onion, reason } => {
            assert_eq!(onion.as_str(), "abc");
            assert!(reason.contains("empty message"), "reason: {reason}");
        }
        other => panic!("expected connection lost, got {other:?}"),
    }

    // The socket was really closed.
    let mut one = [0u8; 1];
    match peer.read(&mut one) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected closed socket, read {n} byte(s)"),
    }

    handle.stop();
    join.join().expect("join reactor");
}

#[test]
fn test_malformed_message_closes_connection() {
    let proxy = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let (handle, events, listen_addr, join) = start_client(proxy.local_addr().expect("addr"));

    let mut peer = TcpStream::connect(listen_addr).expect("dial client");
    peer.write_all(b"ping abc xyz\nstatus bogus\n").expect("write");

    match events.recv_timeout(TIMEOUT).expect("event") {
        ChatEvent::ConnectionLost { onion, reason } => {
            assert_eq!(onion.as_str(), "abc");
            assert!(reason.contains("malformed"), "reason: {reason}");
        }
        other => panic!("expected connection lost, got {other:?}"),
    }

    handle.stop();
    join.join().expect("join reactor");
}

#[test]
fn test_unknown_command_replies_without_closing() {
    let proxy = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let (handle, events, listen_addr, join) = start_client(proxy.local_addr().expect("addr"));

    let mut peer = TcpStream::connect(listen_addr).expect("dial client");
    peer.set_read_timeout(Some(TIMEOUT)).expect("timeout");
    peer.write_all(b"ping abc xyz\nfrobnicate a b\nmessage hi\n")
        .expect("write");

    let mut reader = BufReader::new(peer.try_clone().expect("clone"));
    let mut line = String::new();
    reader.read_line(&mut line).expect("reply line");
    assert_eq!(line.trim_end(), "not_implemented frobnicate");

    // The connection survived: the chat message after the unknown command
    // still arrives.
    match events.recv_timeout(TIMEOUT).expect("event") {
        ChatEvent::Message { onion, text } => {
            assert_eq!(onion.as_str(), "abc");
            assert_eq!(text, "hi");
        }
        other => panic!("expected chat message, got {other:?}"),
    }

    handle.stop();
    join.join().expect("join reactor");
}

#[test]
fn test_displaced_incoming_connection_is_closed() {
    let proxy = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let (handle, _events, listen_addr, join) = start_client(proxy.local_addr().expect("addr"));

    let mut first = TcpStream::connect(listen_addr).expect("dial client");
    first.set_read_timeout(Some(TIMEOUT)).expect("timeout");
    first.write_all(b"ping abc xyz\n").expect("write first ping");
    thread::sleep(Duration::from_millis(500));

    let mut second = TcpStream::connect(listen_addr).expect("dial client again");
    second.write_all(b"ping abc xyz2\n").expect("write second ping");

    // The first connection loses its slot and must be closed, not leaked.
    let mut one = [0u8; 1];
    match first.read(&mut one) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected displaced socket to close, read {n} byte(s)"),
    }

    handle.stop();
    join.join().expect("join reactor");
}

#[test]
fn test_dual_connection_handshake() {
    let proxy = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let (handle, events, listen_addr, join) = start_client(proxy.local_addr().expect("addr"));

    // Peer A dials in and pings.
    let mut a_incoming = TcpStream::connect(listen_addr).expect("dial client");
    a_incoming
        .write_all(b"ping abcdefghijklmnop anonce\n")
        .expect("write ping");

    // The client opens its outgoing connection through the proxy.
    let (mut b_outgoing, _) = proxy.accept().expect("proxy accept");
    b_outgoing.set_read_timeout(Some(TIMEOUT)).expect("timeout");
    let (port, user, host) = read_socks_request(&mut b_outgoing);
    assert_eq!(port, 11009);
    assert_eq!(user, "TorChat");
    assert_eq!(host, "abcdefghijklmnop.onion");
    b_outgoing
        .write_all(&[0x00, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
        .expect("grant request");

    // Fresh outgoing connection: ping, pong, status, version - in order.
    let mut reader = BufReader::new(b_outgoing.try_clone().expect("clone"));
    let mut line = String::new();
    reader.read_line(&mut line).expect("ping line");
    let parts: Vec<&str> = line.trim_end().split(' ').collect();
    assert_eq!(parts.len(), 3, "ping line: {line:?}");
    assert_eq!(parts[0], "ping");
    assert_eq!(parts[1], OWN_ONION);
    let b_nonce = parts[2].to_owned();

    line.clear();
    reader.read_line(&mut line).expect("pong line");
    assert_eq!(line.trim_end(), "pong anonce");

    line.clear();
    reader.read_line(&mut line).expect("status line");
    assert_eq!(line.trim_end(), "status available");

    line.clear();
    reader.read_line(&mut line).expect("version line");
    assert!(line.starts_with("version "), "version line: {line:?}");

    // Echoing the client's nonce on its outgoing completes the handshake.
    b_outgoing
        .write_all(format!("pong {b_nonce}\n").as_bytes())
        .expect("write pong");

    match events.recv_timeout(TIMEOUT).expect("event") {
        ChatEvent::ChatEstablished { onion } => {
            assert_eq!(onion.as_str(), "abcdefghijklmnop");
        }
        other => panic!("expected chat established, got {other:?}"),
    }

    // The peer is ready; a cross-thread chat message goes out on the
    // outgoing connection.
    handle.send_chat(
        OnionAddress::from_string("abcdefghijklmnop").expect("onion"),
        "hi there".to_owned(),
    );
    line.clear();
    reader.read_line(&mut line).expect("chat line");
    assert_eq!(line.trim_end(), "message hi there");

    handle.stop();
    join.join().expect("join reactor");
}

#[test]
fn test_repeated_ping_answers_without_second_outgoing() {
    let proxy = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let (handle, _events, listen_addr, join) = start_client(proxy.local_addr().expect("addr"));

    let mut a_incoming = TcpStream::connect(listen_addr).expect("dial client");
    a_incoming
        .write_all(b"ping abcdefghijklmnop anonce\n")
        .expect("write ping");

    let (mut b_outgoing, _) = proxy.accept().expect("proxy accept");
    b_outgoing.set_read_timeout(Some(TIMEOUT)).expect("timeout");
    let _ = read_socks_request(&mut b_outgoing);
    b_outgoing
        .write_all(&[0x00, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
        .expect("grant request");

    let mut reader = BufReader::new(b_outgoing.try_clone().expect("clone"));
    let mut line = String::new();
    for _ in 0..4 {
        line.clear();
        reader.read_line(&mut line).expect("handshake line");
    }

    // A second ping on the existing pair: pong/status/version again, but
    // no new proxy connection and no second introduction ping.
    a_incoming
        .write_all(b"ping abcdefghijklmnop anonce2\n")
        .expect("write second ping");

    line.clear();
    reader.read_line(&mut line).expect("pong line");
    assert_eq!(line.trim_end(), "pong anonce2");

    proxy
        .set_nonblocking(true)
        .expect("nonblocking proxy listener");
    match proxy.accept() {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Ok(_) => panic!("client opened a second outgoing connection"),
        Err(e) => panic!("proxy listener error: {e}"),
    }

    handle.stop();
    join.join().expect("join reactor");
}
