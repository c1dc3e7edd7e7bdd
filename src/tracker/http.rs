//! HTTP(S) tracker announce: a `GET` against the announce URL with a
//! percent-encoded query string, decoding a bencoded reply.

use crate::endpoint::{self, Endpoint};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::time::Duration;
use thiserror::Error;
use urlencoding::encode_binary;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum HttpTrackerError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid tracker response: {0}")]
    InvalidTrackerResponse(#[from] serde_bencode::Error),
    #[error(transparent)]
    MalformedPeers(#[from] endpoint::PeerDataError),
}

#[derive(Debug, Deserialize)]
struct AnnounceReply {
    #[allow(dead_code)]
    interval: i64,
    peers: ByteBuf,
}

/// Composes and sends a single HTTP(S) announce request. `tracker_url` is
/// taken as a parameter rather than read off the descriptor, so the
/// descriptor stays immutable across a multi-tracker dispatch loop.
pub fn announce_once(
    tracker_url: &str,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    left: u64,
) -> Result<Vec<Endpoint>, HttpTrackerError> {
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}&event=started",
        encode_binary(&info_hash),
        encode_binary(&peer_id),
        port,
        left,
    );
    let sep = if tracker_url.contains('?') { '&' } else { '?' };
    let url = format!("{tracker_url}{sep}{query}");

    let client = reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let body = client.get(&url).send()?.error_for_status()?.bytes()?;

    let reply: AnnounceReply = serde_bencode::from_bytes(&body)?;
    let peers = endpoint::parse(reply.peers.as_ref())?;
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_bencode_reply_is_reported_as_invalid_tracker_response() {
        let err = serde_bencode::from_bytes::<AnnounceReply>(b"not bencode");
        assert!(err.is_err());
    }

    #[test]
    fn query_string_percent_encodes_raw_bytes() {
        let info_hash = [0x12u8; 20];
        let peer_id = [0x34u8; 20];
        let encoded_hash = encode_binary(&info_hash);
        assert!(encoded_hash.contains("%12"));
        let _ = peer_id;
    }
}
