//! UDP tracker announce (BEP 15): a connect transaction followed by an
//! announce transaction over a single UDP socket, with exponential backoff
//! on read timeouts.

use crate::endpoint::{self, Endpoint};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::{self, Cursor, Write};
use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;
use thiserror::Error;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const MAX_RETRIES: u32 = 8;
const INITIAL_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum UdpTrackerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("UDP transaction id mismatch")]
    UDPTransactionMismatch,
    #[error("unexpected UDP action in response")]
    UDPUnexpectedAction,
    /// Reserved for a future implementation that caches and refreshes
    /// connection ids across announces (BEP 15 permits reuse for two
    /// minutes); this crate never holds a connection id past one announce,
    /// so this variant is never constructed.
    #[error("UDP connection id expired")]
    UDPConnectionExpired,
    #[error("UDP tracker timed out after all retries")]
    UDPTimeout,
    #[error("UDP tracker returned an error: {0}")]
    TrackerError(String),
    #[error(transparent)]
    MalformedPeers(#[from] endpoint::PeerDataError),
}

/// Sends `request`, retrying on read timeout with `15 * 2^attempt` second
/// deadlines, up to `MAX_RETRIES` retries (9 attempts total). Write errors
/// are fatal immediately. The read deadline is set fresh on every attempt.
fn send_with_retry(
    socket: &UdpSocket,
    request: &[u8],
    min_reply_len: usize,
) -> Result<Vec<u8>, UdpTrackerError> {
    for attempt in 0..=MAX_RETRIES {
        let deadline = Duration::from_secs(INITIAL_TIMEOUT_SECS) * 2u32.pow(attempt);
        socket.set_read_timeout(Some(deadline))?;
        socket.send(request)?;

        let mut buf = vec![0u8; 2048];
        match socket.recv(&mut buf) {
            Ok(n) if n >= min_reply_len => {
                buf.truncate(n);
                return Ok(buf);
            }
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(UdpTrackerError::UDPTimeout)
}

fn random_transaction_id() -> u32 {
    rand::thread_rng().gen::<u32>()
}

fn connect(socket: &UdpSocket) -> Result<u64, UdpTrackerError> {
    let txn_id = random_transaction_id();
    let mut req = Vec::with_capacity(16);
    req.write_u64::<BigEndian>(PROTOCOL_ID)?;
    req.write_u32::<BigEndian>(ACTION_CONNECT)?;
    req.write_u32::<BigEndian>(txn_id)?;

    let reply = send_with_retry(socket, &req, 16)?;
    let mut cur = Cursor::new(&reply);
    let action = cur.read_u32::<BigEndian>()?;
    let reply_txn_id = cur.read_u32::<BigEndian>()?;

    if action != ACTION_CONNECT {
        return Err(UdpTrackerError::UDPUnexpectedAction);
    }
    if reply_txn_id != txn_id {
        return Err(UdpTrackerError::UDPTransactionMismatch);
    }
    Ok(cur.read_u64::<BigEndian>()?)
}

fn announce(
    socket: &UdpSocket,
    connection_id: u64,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    left: u64,
) -> Result<Vec<Endpoint>, UdpTrackerError> {
    let txn_id = random_transaction_id();
    let mut req = Vec::with_capacity(98);
    req.write_u64::<BigEndian>(connection_id)?;
    req.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    req.write_u32::<BigEndian>(txn_id)?;
    req.write_all(&info_hash)?;
    req.write_all(&peer_id)?;
    req.write_u64::<BigEndian>(0)?; // downloaded
    req.write_u64::<BigEndian>(left)?;
    req.write_u64::<BigEndian>(0)?; // uploaded
    req.write_u32::<BigEndian>(0)?; // event: none
    req.write_u32::<BigEndian>(0)?; // ip: default
    req.write_u32::<BigEndian>(txn_id)?; // key
    req.write_i32::<BigEndian>(i32::MAX)?; // num_want
    req.write_u16::<BigEndian>(port)?;
    debug_assert_eq!(req.len(), 98);

    let reply = send_with_retry(socket, &req, 20)?;
    let mut cur = Cursor::new(&reply);
    let action = cur.read_u32::<BigEndian>()?;
    let reply_txn_id = cur.read_u32::<BigEndian>()?;

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&reply[8..]).into_owned();
        return Err(UdpTrackerError::TrackerError(message));
    }
    if action != ACTION_ANNOUNCE {
        return Err(UdpTrackerError::UDPUnexpectedAction);
    }
    if reply_txn_id != txn_id {
        return Err(UdpTrackerError::UDPTransactionMismatch);
    }

    // interval (u32), leechers (u32), seeders (u32) occupy bytes [8..20);
    // the rest is a compact peer list.
    Ok(endpoint::parse(&reply[20..])?)
}

/// Runs the full connect+announce transaction against `host:port`.
pub fn announce_once(
    host_port: &str,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    left: u64,
) -> Result<Vec<Endpoint>, UdpTrackerError> {
    let addr = host_port
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address for tracker"))?;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(addr)?;

    let connection_id = connect(&socket)?;
    announce(&socket, connection_id, info_hash, peer_id, port, left)
}
