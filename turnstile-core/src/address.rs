//! Endpoint addressing and link-class derivation.
//!
//! A logical endpoint lives at an [`Address`]. Traffic to and from it is
//! carried on two independent links, one per [`LinkClass`], each with its
//! own credit window so mutex traffic is never queued behind bulk fetch
//! traffic. Both sides derive the transport address for a class the same
//! way, so a server endpoint at `A` receives exactly what a client endpoint
//! at `A` sends.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical lane a message travels on.
///
/// Each class owns an independent link (and credit window) in each
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkClass {
    /// REST-like request/response traffic (`GET`/`PUT`/`POST`/`DELETE`).
    Fetch,
    /// Mutex acquires and their dispositions.
    Mutex,
}

impl LinkClass {
    /// Both classes, in a fixed order.
    pub const ALL: [LinkClass; 2] = [LinkClass::Fetch, LinkClass::Mutex];

    /// Address tag appended to the endpoint address for this class.
    pub const fn tag(self) -> &'static str {
        match self {
            LinkClass::Fetch => "FETCH",
            LinkClass::Mutex => "MUTEX",
        }
    }
}

impl fmt::Display for LinkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A normalised endpoint address.
///
/// Addresses always begin with `/`; construction inserts the leading slash
/// if it is missing. No other rewriting is performed, so `"/a/b"` and
/// `"/a//b"` remain distinct addresses (request *paths*, by contrast, skip
/// empty segments — that happens in the routing layer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Normalise `raw` into an address.
    pub fn new(raw: &str) -> Self {
        if raw.starts_with('/') {
            Self(raw.to_string())
        } else {
            Self(format!("/{raw}"))
        }
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Transport address carrying `class` traffic for this endpoint.
    pub fn link_address(&self, class: LinkClass) -> String {
        format!("{}/{}", self.0, class.tag())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_slash_inserted() {
        assert_eq!(Address::new("names").as_str(), "/names");
        assert_eq!(Address::new("/names").as_str(), "/names");
    }

    #[test]
    fn test_normalisation_is_idempotent() {
        let once = Address::new("locks");
        let twice = Address::new(once.as_str());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_link_address_derivation() {
        let address = Address::new("/api");
        assert_eq!(address.link_address(LinkClass::Fetch), "/api/FETCH");
        assert_eq!(address.link_address(LinkClass::Mutex), "/api/MUTEX");
    }

    #[test]
    fn test_derivation_symmetric_for_both_sides() {
        // Client and server must land on the same transport address.
        let client_side = Address::new("api").link_address(LinkClass::Mutex);
        let server_side = Address::new("/api").link_address(LinkClass::Mutex);
        assert_eq!(client_side, server_side);
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::new("/a/b").to_string(), "/a/b");
        assert_eq!(LinkClass::Fetch.to_string(), "FETCH");
    }
}
