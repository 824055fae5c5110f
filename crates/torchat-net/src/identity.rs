//! Onion service identifiers.
//!
//! An onion address is an opaque service id. The core never resolves it;
//! name resolution is delegated to the SOCKS4a proxy. Validation is
//! therefore shallow: both 16-character v2-style and 56-character v3-style
//! ids pass, and the `.onion` suffix is accepted and stripped on input.

use crate::error::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the per-process random handshake nonce.
const NONCE_LEN: usize = 24;

/// An opaque onion service id, stored without the `.onion` suffix.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Parse and normalize an onion address string.
    ///
    /// Lowercases, strips a trailing `.onion` if present, and rejects
    /// anything empty or containing non-alphanumeric bytes.
    pub fn from_string(s: impl Into<String>) -> Result<Self> {
        let mut s = s.into().trim().to_lowercase();
        if let Some(stripped) = s.strip_suffix(".onion") {
            s = stripped.to_owned();
        }
        if s.is_empty() {
            return Err(Error::MalformedMessage("empty onion address".into()));
        }
        if !s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
            return Err(Error::MalformedMessage(format!(
                "invalid onion address: {s:?}"
            )));
        }
        Ok(Self(s))
    }

    /// The bare service id, as sent inside `ping` messages.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hostname handed to the proxy: `<id>.onion`.
    pub fn hostname(&self) -> String {
        format!("{}.onion", self.0)
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({})", self.0)
    }
}

impl TryFrom<String> for OnionAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::from_string(s)
    }
}

impl From<OnionAddress> for String {
    fn from(a: OnionAddress) -> String {
        a.0
    }
}

/// Generate the per-process handshake nonce.
///
/// Regenerated on every start; peers echo it back inside `pong` to prove
/// they control the address they advertise.
pub fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_onion_suffix() {
        let addr = OnionAddress::from_string("AbCdEfGhIjKlMnOp.onion").expect("parse");
        assert_eq!(addr.as_str(), "abcdefghijklmnop");
        assert_eq!(addr.hostname(), "abcdefghijklmnop.onion");
    }

    #[test]
    fn test_accepts_bare_id() {
        let addr = OnionAddress::from_string("abcdefghijklmnop").expect("parse");
        assert_eq!(addr.as_str(), "abcdefghijklmnop");
    }

    #[test]
    fn test_rejects_empty_and_garbage() {
        assert!(OnionAddress::from_string("").is_err());
        assert!(OnionAddress::from_string(".onion").is_err());
        assert!(OnionAddress::from_string("has space").is_err());
        assert!(OnionAddress::from_string("semi;colon").is_err());
    }

    #[test]
    fn test_nonce_is_fresh() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), NONCE_LEN);
        assert_ne!(a, b);
    }
}
