//! Compact peer list codec: 6-byte `(IPv4, port)` records, as returned by
//! both the HTTP tracker's `peers` byte string and the tail of a UDP
//! announce reply.

use std::net::Ipv4Addr;
use thiserror::Error;

const RECORD_SIZE: usize = 6;

#[derive(Debug, Error)]
pub enum PeerDataError {
    #[error("malformed peer data: length {0} is not a multiple of {RECORD_SIZE}")]
    MalformedPeerData(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint { addr, port }
    }

    /// Canonical `address:port` form, used both for display and as the
    /// deduplication key across trackers.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Parses a compact peer list. Fails if `raw.len()` isn't a multiple of 6.
pub fn parse(raw: &[u8]) -> Result<Vec<Endpoint>, PeerDataError> {
    if raw.len() % RECORD_SIZE != 0 {
        return Err(PeerDataError::MalformedPeerData(raw.len()));
    }

    Ok(raw
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| {
            let addr = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Endpoint::new(addr, port)
        })
        .collect())
}
