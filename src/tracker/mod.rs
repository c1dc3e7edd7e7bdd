//! Multi-tracker dispatcher: builds the ordered, deduplicated tracker list
//! from the descriptor's tiers, tries each independently, and accumulates a
//! deduplicated peer set.

pub mod http;
pub mod udp;

use crate::endpoint::Endpoint;
use crate::torrent::Torrent;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no peers obtained from any tracker")]
    NoPeers,
}

/// Builds the ordered tracker list: announce-list tiers concatenated in
/// order, then the primary announce URL appended if it isn't already
/// present. Order-preserving deduplication by URL string.
fn tracker_urls(torrent: &Torrent) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for tier in &torrent.announce_list {
        for url in tier {
            if seen.insert(url.clone()) {
                urls.push(url.clone());
            }
        }
    }
    if seen.insert(torrent.announce.clone()) {
        urls.push(torrent.announce.clone());
    }
    urls
}

/// Tries a single tracker URL, dispatching strictly on scheme: `http`/`https`
/// use the HTTP(S) announce, `udp` uses the UDP connect/announce transaction.
/// Any other scheme, or an announce failure, is logged and skipped by the
/// caller.
fn announce_single(
    tracker_url: &str,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    left: u64,
) -> anyhow::Result<Vec<Endpoint>> {
    let parsed = Url::parse(tracker_url)?;
    match parsed.scheme() {
        "http" | "https" => {
            Ok(http::announce_once(tracker_url, info_hash, peer_id, port, left)?)
        }
        "udp" => {
            let host = parsed
                .host_str()
                .ok_or_else(|| anyhow::anyhow!("udp tracker url has no host: {tracker_url}"))?;
            let udp_port = parsed
                .port()
                .ok_or_else(|| anyhow::anyhow!("udp tracker url has no port: {tracker_url}"))?;
            let host_port = format!("{host}:{udp_port}");
            Ok(udp::announce_once(&host_port, info_hash, peer_id, port, left)?)
        }
        other => anyhow::bail!("unsupported tracker scheme: {other}"),
    }
}

/// Queries every tracker in turn, logging and skipping failures, and returns
/// the deduplicated peer set. Fails with `NoPeers` if nothing came back from
/// any tracker.
pub fn find_peers(
    torrent: &Torrent,
    peer_id: [u8; 20],
    port: u16,
) -> Result<Vec<Endpoint>, TrackerError> {
    let mut dedup: HashSet<String> = HashSet::new();
    let mut peers = Vec::new();

    for url in tracker_urls(torrent) {
        match announce_single(&url, torrent.info_hash, peer_id, port, torrent.length) {
            Ok(found) => {
                log::info!("tracker {url} returned {} peers", found.len());
                for peer in found {
                    if dedup.insert(peer.canonical()) {
                        peers.push(peer);
                    }
                }
            }
            Err(e) => {
                log::warn!("tracker {url} failed: {e:#}");
            }
        }
    }

    if peers.is_empty() {
        return Err(TrackerError::NoPeers);
    }
    Ok(peers)
}
