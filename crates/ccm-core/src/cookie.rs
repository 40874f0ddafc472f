//! Partition cookie.
//!
//! A cookie is a random token identifying one instance of an agreed
//! partition. Consider a node physically reachable from two partitions X
//! and Y that never synchronized: it receives protocol traffic from both,
//! and the cookie is what keeps the two message streams from
//! cross-contaminating. The leader rotates the cookie exactly when it
//! publishes a membership whose node set differs from the previous one.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use ccm_proto::constants::COOKIE_LEN;

/// A partition-instance token. Fixed length, printable ASCII, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie(String);

impl Cookie {
    /// Generate a fresh random cookie.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let s: String = (0..COOKIE_LEN)
            .map(|_| rng.gen_range(b'!'..=b'~') as char)
            .collect();
        Cookie(s)
    }

    /// Adopt a cookie received on the wire.
    pub fn new(s: impl Into<String>) -> Self {
        Cookie(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when an incoming message's cookie belongs to this partition
    /// instance.
    pub fn matches(&self, incoming: &str) -> bool {
        self.0 == incoming
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_cookie_shape() {
        let c = Cookie::generate();
        assert_eq!(c.as_str().len(), COOKIE_LEN);
        assert!(c.as_str().bytes().all(|b| (b'!'..=b'~').contains(&b)));
    }

    #[test]
    fn test_generated_cookies_differ() {
        // Collisions over a 94^14 space would point at a broken RNG.
        let a = Cookie::generate();
        let b = Cookie::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_matches() {
        let c = Cookie::new("ctx-1");
        assert!(c.matches("ctx-1"));
        assert!(!c.matches("ctx-2"));
        assert!(!c.matches(""));
    }
}
