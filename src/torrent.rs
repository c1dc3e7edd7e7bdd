//! Metainfo (`.torrent`) decoding. Out of the three core subsystems this
//! crate is built around, the decoder is the "external collaborator" whose
//! contract is named, not designed. It still needs a real implementation
//! for the binary to run end to end.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::path::Path;

const HASH_LEN: usize = 20;

#[derive(Debug, Deserialize, Serialize)]
struct BencodeInfo {
    name: String,
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: i64,
    /// Multi-file torrents are out of scope; a single-file torrent always
    /// carries `length` directly on the info dictionary.
    length: i64,
}

#[derive(Debug, Deserialize, Serialize)]
struct BencodeTorrent {
    info: BencodeInfo,
    announce: String,
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

/// The torrent descriptor: everything the tracker dispatcher and
/// piece-fetch engine need, decoded once and immutable thereafter.
#[derive(Debug, Clone)]
pub struct Torrent {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub info_hash: [u8; HASH_LEN],
    pub piece_hashes: Vec<[u8; HASH_LEN]>,
    pub piece_length: u64,
    pub length: u64,
    pub name: String,
}

impl Torrent {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Torrent> {
        let raw: BencodeTorrent = from_bytes(bytes).context("failed to decode metainfo file")?;
        Self::from_bencode(raw)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Torrent> {
        let bytes = std::fs::read(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        Self::from_bytes(&bytes)
    }

    fn from_bencode(raw: BencodeTorrent) -> anyhow::Result<Torrent> {
        let info_bytes = to_bytes(&raw.info).context("failed to re-encode info dictionary")?;
        let mut hasher = Sha1::new();
        hasher.update(&info_bytes);
        let info_hash: [u8; HASH_LEN] = hasher.finalize().into();

        let pieces = raw.info.pieces.as_ref();
        if pieces.len() % HASH_LEN != 0 {
            anyhow::bail!(
                "piece hash blob length {} is not a multiple of 20",
                pieces.len()
            );
        }
        let piece_hashes = pieces
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut h = [0u8; HASH_LEN];
                h.copy_from_slice(chunk);
                h
            })
            .collect();

        Ok(Torrent {
            announce: raw.announce,
            announce_list: raw.announce_list.unwrap_or_default(),
            info_hash,
            piece_hashes,
            piece_length: raw.info.piece_length as u64,
            length: raw.info.length as u64,
            name: raw.info.name,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte length of piece `index`: `piece_length` for every piece but the
    /// last, which is whatever remains of `length`.
    pub fn piece_size(&self, index: usize) -> u64 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);
        end - begin
    }
}
