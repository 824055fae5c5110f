//! Typed protocol messages.
//!
//! The first space-delimited token of a decoded message names the command;
//! the remainder is command-specific positional fields. Commands map to
//! [`Msg`] variants through an explicit table, with [`Msg::Unknown`] as the
//! fallback so unrecognized commands never kill a connection.

use super::wire::MessageBuffer;
use crate::error::{Error, Result};
use crate::identity::OnionAddress;
use std::fmt;
use std::str::FromStr;

/// Availability states carried by the `status` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Online and accepting chat.
    Available,
    /// Temporarily away.
    Away,
    /// Away for an extended period.
    ExtendedAway,
}

impl FromStr for PeerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(Self::Available),
            "away" => Ok(Self::Away),
            "xa" => Ok(Self::ExtendedAway),
            other => Err(Error::MalformedMessage(format!(
                "unknown status state: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => f.write_str("available"),
            Self::Away => f.write_str("away"),
            Self::ExtendedAway => f.write_str("xa"),
        }
    }
}

/// A parsed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// Contact request carrying the sender's address and a fresh nonce.
    Ping {
        /// Onion address the sender claims to control.
        onion: OnionAddress,
        /// Random string to be echoed back over the sender's own service.
        nonce: String,
    },
    /// Echo of a previously received ping nonce.
    Pong {
        /// The nonce being echoed.
        nonce: String,
    },
    /// Availability announcement.
    Status(PeerStatus),
    /// Software version announcement.
    Version(String),
    /// A chat message; the body runs to the end of the message.
    Chat(String),
    /// Reply sent for commands we do not understand.
    NotImplemented {
        /// The offending command, when the sender named it.
        command: String,
    },
    /// A command outside the table. Provokes a `not_implemented` reply.
    Unknown {
        /// The unrecognized command token.
        command: String,
    },
}

impl Msg {
    /// Parse one complete, already-decoded message.
    ///
    /// Fails with [`Error::EndOfInput`] when the message is empty and with
    /// [`Error::MalformedMessage`] when a field of a known command cannot
    /// be read.
    pub fn parse(buf: &mut MessageBuffer) -> Result<Self> {
        let command = buf.read_command()?;
        match command.as_str() {
            "ping" => {
                let onion = OnionAddress::from_string(field(buf, "ping", "onion address")?)?;
                let nonce = field(buf, "ping", "nonce")?;
                Ok(Msg::Ping { onion, nonce })
            }
            "pong" => Ok(Msg::Pong {
                nonce: field(buf, "pong", "nonce")?,
            }),
            "status" => field(buf, "status", "state")?.parse().map(Msg::Status),
            "version" => Ok(Msg::Version(field(buf, "version", "version string")?)),
            "message" => {
                let body = buf
                    .read_string_until_end()
                    .map_err(|_| Error::MalformedMessage("message: missing body".into()))?;
                Ok(Msg::Chat(body))
            }
            "not_implemented" => Ok(Msg::NotImplemented {
                command: buf.read_string().unwrap_or_default(),
            }),
            _ => Ok(Msg::Unknown { command }),
        }
    }

    /// Serialize into a fresh message buffer, ready for encoding.
    pub fn to_buffer(&self) -> MessageBuffer {
        let mut buf = MessageBuffer::new();
        match self {
            Msg::Ping { onion, nonce } => {
                buf.write_string("ping");
                buf.write_string(onion.as_str());
                buf.write_string(nonce);
            }
            Msg::Pong { nonce } => {
                buf.write_string("pong");
                buf.write_string(nonce);
            }
            Msg::Status(status) => {
                buf.write_string("status");
                buf.write_string(&status.to_string());
            }
            Msg::Version(version) => {
                buf.write_string("version");
                buf.write_string(version);
            }
            Msg::Chat(body) => {
                buf.write_string("message");
                buf.write_string(body);
            }
            Msg::NotImplemented { command } | Msg::Unknown { command } => {
                buf.write_string("not_implemented");
                if !command.is_empty() {
                    buf.write_string(command);
                }
            }
        }
        buf
    }
}

fn field(buf: &mut MessageBuffer, command: &str, name: &str) -> Result<String> {
    buf.read_string()
        .map_err(|_| Error::MalformedMessage(format!("{command}: missing {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<Msg> {
        Msg::parse(&mut MessageBuffer::from_received(raw))
    }

    #[test]
    fn test_parse_ping() {
        let msg = parse(b"ping abcdefghijklmnop xyz").expect("parse");
        assert_eq!(
            msg,
            Msg::Ping {
                onion: OnionAddress::from_string("abcdefghijklmnop").expect("onion"),
                nonce: "xyz".into(),
            }
        );
    }

    #[test]
    fn test_parse_ping_missing_nonce() {
        assert!(matches!(
            parse(b"ping abcdefghijklmnop"),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(
            parse(b"status available").expect("parse"),
            Msg::Status(PeerStatus::Available)
        );
        assert!(matches!(
            parse(b"status sleeping"),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_parse_chat_body_runs_to_end() {
        assert_eq!(
            parse(b"message one two three").expect("parse"),
            Msg::Chat("one two three".into())
        );
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(
            parse(b"frobnicate a b c").expect("parse"),
            Msg::Unknown {
                command: "frobnicate".into()
            }
        );
    }

    #[test]
    fn test_parse_empty_message() {
        assert!(matches!(parse(b""), Err(Error::EndOfInput)));
    }

    #[test]
    fn test_serialize_handshake_messages() {
        let ping = Msg::Ping {
            onion: OnionAddress::from_string("abcdefghijklmnop").expect("onion"),
            nonce: "n0nce".into(),
        };
        assert_eq!(
            ping.to_buffer().encode_for_sending(),
            b"ping abcdefghijklmnop n0nce\n"
        );

        let pong = Msg::Pong {
            nonce: "n0nce".into(),
        };
        assert_eq!(pong.to_buffer().encode_for_sending(), b"pong n0nce\n");

        let status = Msg::Status(PeerStatus::Available);
        assert_eq!(status.to_buffer().encode_for_sending(), b"status available\n");
    }

    #[test]
    fn test_not_implemented_roundtrip() {
        let reply = Msg::Unknown {
            command: "frobnicate".into(),
        };
        let encoded = reply.to_buffer().encode_for_sending();
        assert_eq!(encoded, b"not_implemented frobnicate\n");
        let parsed = parse(&encoded[..encoded.len() - 1]).expect("parse");
        assert_eq!(
            parsed,
            Msg::NotImplemented {
                command: "frobnicate".into()
            }
        );
    }

    #[test]
    fn test_chat_with_escaped_newline() {
        let chat = Msg::Chat("hello\nworld".into());
        let encoded = chat.to_buffer().encode_for_sending();
        assert_eq!(encoded, b"message hello\\nworld\n");
        assert_eq!(
            parse(&encoded[..encoded.len() - 1]).expect("parse"),
            Msg::Chat("hello\nworld".into())
        );
    }
}
