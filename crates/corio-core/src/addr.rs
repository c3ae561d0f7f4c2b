//! Resolved-address types carried across the DNS reactor boundary.
//!
//! The reactor resolves names on the caller's behalf; the result travels
//! back as an owned [`AddrInfoList`]. Ownership replaces the legacy
//! `freeaddrinfo` — dropping the list frees the chain.

use std::net::SocketAddr;

/// Lookup hints, mirroring the `struct addrinfo` request fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInfoHints {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub flags: i32,
}

impl Default for AddrInfoHints {
    fn default() -> Self {
        Self {
            family: libc::AF_UNSPEC,
            socktype: 0,
            protocol: 0,
            flags: 0,
        }
    }
}

impl AddrInfoHints {
    /// Hints for an IPv4 stream lookup (the `gethostbyname` profile).
    pub fn inet_stream() -> Self {
        Self {
            family: libc::AF_INET,
            socktype: libc::SOCK_STREAM,
            ..Self::default()
        }
    }
}

/// One resolved entry of an address chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub addr: SocketAddr,
    /// Canonical name of the host, when the resolver reports one. Only the
    /// first entry of a chain carries it.
    pub canonname: Option<String>,
}

/// An owned resolved-address chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrInfoList(pub Vec<AddrInfo>);

impl AddrInfoList {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&AddrInfo> {
        self.0.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AddrInfo> {
        self.0.iter()
    }
}
