//! Logging helpers.

use crate::identity::OnionAddress;
use std::fmt;

/// Shortened display of an onion address for log lines.
///
/// Shows the first and last four characters so concurrent sessions stay
/// distinguishable without writing full addresses into log files.
pub struct ShortOnion<'a>(pub &'a OnionAddress);

impl fmt::Display for ShortOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.as_str();
        if s.len() > 12 {
            write!(f, "{}..{}", &s[..4], &s[s.len() - 4..])
        } else {
            f.write_str(s)
        }
    }
}

impl fmt::Debug for ShortOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
