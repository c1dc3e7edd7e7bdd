//! Fixed-shape 68-byte BitTorrent handshake: 1-byte protocol string length,
//! the protocol string itself, 8 reserved zero bytes, the 20-byte info hash,
//! and the 20-byte peer identifier.

use std::io::{self, Read, Write};
use thiserror::Error;

const PROTOCOL: &str = "BitTorrent protocol";
const RESERVED_LEN: usize = 8;
const HASH_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid protocol length: length byte was zero")]
    InvalidProtocolLen,
    #[error("info hash mismatch")]
    InfoHashMismatch,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pstr: String,
    pub reserved: [u8; RESERVED_LEN],
    pub info_hash: [u8; HASH_LEN],
    pub peer_id: [u8; HASH_LEN],
}

impl Handshake {
    pub fn new(info_hash: [u8; HASH_LEN], peer_id: [u8; HASH_LEN]) -> Handshake {
        Handshake {
            pstr: PROTOCOL.to_string(),
            reserved: [0; RESERVED_LEN],
            info_hash,
            peer_id,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let pstr_bytes = self.pstr.as_bytes();
        let mut buf = Vec::with_capacity(1 + pstr_bytes.len() + RESERVED_LEN + HASH_LEN * 2);
        buf.push(pstr_bytes.len() as u8);
        buf.extend_from_slice(pstr_bytes);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.pack())
    }

    /// Reads a length-prefixed handshake off the stream. `N` (the protocol
    /// string length) is read dynamically rather than assumed to be 19, so a
    /// future protocol string of a different length still round-trips.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Handshake, HandshakeError> {
        let mut len_buf = [0u8; 1];
        r.read_exact(&mut len_buf)?;
        let pstr_len = len_buf[0] as usize;
        if pstr_len == 0 {
            return Err(HandshakeError::InvalidProtocolLen);
        }

        let mut rest = vec![0u8; pstr_len + RESERVED_LEN + HASH_LEN * 2];
        r.read_exact(&mut rest)?;

        let pstr = String::from_utf8_lossy(&rest[..pstr_len]).into_owned();
        let mut reserved = [0u8; RESERVED_LEN];
        reserved.copy_from_slice(&rest[pstr_len..pstr_len + RESERVED_LEN]);

        let hash_start = pstr_len + RESERVED_LEN;
        let mut info_hash = [0u8; HASH_LEN];
        info_hash.copy_from_slice(&rest[hash_start..hash_start + HASH_LEN]);

        let mut peer_id = [0u8; HASH_LEN];
        peer_id.copy_from_slice(&rest[hash_start + HASH_LEN..hash_start + HASH_LEN * 2]);

        Ok(Handshake {
            pstr,
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn matches_info_hash(&self, expected: &[u8; HASH_LEN]) -> bool {
        &self.info_hash == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let hs = Handshake::new([7u8; 20], [9u8; 20]);
        let bytes = hs.pack();
        assert_eq!(bytes.len(), 1 + 19 + 8 + 20 + 20);
        let hs2 = Handshake::read_from(&mut &bytes[..]).unwrap();
        assert_eq!(hs, hs2);
    }

    #[test]
    fn zero_length_byte_is_rejected() {
        let bytes = [0u8; 1];
        let err = Handshake::read_from(&mut &bytes[..]).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidProtocolLen));
    }

    #[test]
    fn info_hash_mismatch_is_detected_by_caller() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.matches_info_hash(&[1u8; 20]));
        assert!(!hs.matches_info_hash(&[9u8; 20]));
    }
}
