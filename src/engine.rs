//! Piece-fetch engine: one blocking worker thread per peer, pulling jobs off
//! a shared bounded queue, pipelining block requests, verifying each piece's
//! hash, and handing verified pieces to the aggregator in this thread.

use crate::endpoint::Endpoint;
use crate::peer::connection::Connection;
use crate::peer::message::{self, FrameError, Message};
use crate::torrent::Torrent;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use sha1::{Digest, Sha1};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const MAX_PENDING: usize = 5;
const BLOCK_SIZE: usize = 16 * 1024;
const PIECE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("every worker exited before all pieces were delivered")]
    AllWorkersExited,
}

#[derive(Debug, Error)]
enum FetchError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone)]
struct Job {
    index: usize,
    hash: [u8; 20],
    length: usize,
}

struct PieceResult {
    index: usize,
    buffer: Vec<u8>,
}

/// Runs the whole fetch: spawns one worker per peer, seeds the job queue
/// with one job per piece, and assembles verified pieces into a single
/// output buffer sized to the torrent's total length.
pub fn run(
    torrent: &Torrent,
    peers: Vec<Endpoint>,
    local_peer_id: [u8; 20],
) -> Result<Vec<u8>, EngineError> {
    let num_pieces = torrent.num_pieces();
    let (job_tx, job_rx) = bounded::<Job>(num_pieces);
    let (result_tx, result_rx) = unbounded::<PieceResult>();
    // Bounded at zero capacity and never sent on: its only purpose is to let
    // the aggregator broadcast "no more pieces remain" by dropping its
    // sender, which disconnects every worker's `select!` on this channel.
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

    for index in 0..num_pieces {
        let job = Job {
            index,
            hash: torrent.piece_hashes[index],
            length: torrent.piece_size(index) as usize,
        };
        job_tx
            .send(job)
            .expect("job queue is sized to exactly num_pieces");
    }

    let active_workers = Arc::new(AtomicUsize::new(0));
    let info_hash = torrent.info_hash;

    let handles: Vec<_> = peers
        .into_iter()
        .map(|peer| {
            let job_tx = job_tx.clone();
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let shutdown_rx = shutdown_rx.clone();
            let active_workers = active_workers.clone();
            thread::spawn(move || {
                worker_loop(
                    peer,
                    local_peer_id,
                    info_hash,
                    job_tx,
                    job_rx,
                    result_tx,
                    shutdown_rx,
                    active_workers,
                )
            })
        })
        .collect();
    drop(job_tx);
    drop(job_rx);
    drop(result_tx);

    let mut output = vec![0u8; torrent.length as usize];
    let mut delivered = 0usize;
    while delivered < num_pieces {
        let result = result_rx.recv().map_err(|_| EngineError::AllWorkersExited)?;
        let begin = result.index * torrent.piece_length as usize;
        let end = begin + result.buffer.len();
        output[begin..end].copy_from_slice(&result.buffer);
        delivered += 1;
    }

    drop(shutdown_tx);
    for handle in handles {
        let _ = handle.join();
    }
    Ok(output)
}

fn worker_loop(
    peer: Endpoint,
    local_peer_id: [u8; 20],
    info_hash: [u8; 20],
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
    result_tx: Sender<PieceResult>,
    shutdown_rx: Receiver<()>,
    active_workers: Arc<AtomicUsize>,
) {
    let mut conn = match Connection::connect(peer, local_peer_id, info_hash) {
        Ok(conn) => conn,
        Err(e) => {
            log::warn!("peer {peer}: connect failed: {e}");
            return;
        }
    };

    if let Err(e) = conn.send_unchoke().and_then(|_| conn.send_interested()) {
        log::warn!("peer {peer}: failed to send initial messages: {e}");
        return;
    }

    active_workers.fetch_add(1, Ordering::SeqCst);
    log::debug!(
        "peer {peer}: worker started ({} active)",
        active_workers.load(Ordering::SeqCst)
    );

    loop {
        let job = select! {
            recv(job_rx) -> msg => match msg {
                Ok(job) => job,
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => break,
        };

        if !conn.bitmap.check(job.index) {
            let _ = job_tx.send(job);
            continue;
        }

        match fetch_piece(&mut conn, &job) {
            Ok(buffer) => {
                if !piece_hash_matches(&buffer, &job.hash) {
                    log::warn!("peer {peer}: piece {} failed hash verification", job.index);
                    let _ = job_tx.send(job);
                    continue;
                }
                if let Err(e) = conn.send_have(job.index as u32) {
                    log::warn!("peer {peer}: failed to announce piece {}: {e}", job.index);
                }
                let index = job.index;
                if result_tx.send(PieceResult { index, buffer }).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("peer {peer}: piece {} transport failure: {e}", job.index);
                let _ = job_tx.send(job);
                break;
            }
        }
    }

    active_workers.fetch_sub(1, Ordering::SeqCst);
    log::debug!("peer {peer}: worker exiting");
}

fn piece_hash_matches(buffer: &[u8], expected: &[u8; 20]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(buffer);
    let digest: [u8; 20] = hasher.finalize().into();
    digest == *expected
}

/// Pipelines block requests over `conn` until `job.length` bytes have been
/// received, respecting choke state. Rearms a fresh 30-second deadline.
fn fetch_piece(conn: &mut Connection, job: &Job) -> Result<Vec<u8>, FetchError> {
    conn.set_piece_deadline(PIECE_DEADLINE)?;

    let mut buffer = vec![0u8; job.length];
    let mut received = 0usize;
    let mut requested = 0usize;
    let mut pending = 0usize;

    while received < job.length {
        if !conn.choked {
            while pending < MAX_PENDING && requested < job.length {
                let block_size = (job.length - requested).min(BLOCK_SIZE) as u32;
                conn.send_request(job.index as u32, requested as u32, block_size)?;
                requested += block_size as usize;
                pending += 1;
            }
        }

        match conn.read()? {
            None => {}
            Some(Message::Unchoke) => conn.choked = false,
            Some(Message::Choke) => conn.choked = true,
            Some(Message::Have(index)) => conn.bitmap.mark(index as usize),
            Some(msg @ Message::Piece { .. }) => {
                let written = message::read_piece_data(&mut buffer, job.index as u32, &msg)?;
                received += written;
                pending = pending.saturating_sub(1);
            }
            Some(_) => {}
        }
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::handshake::Handshake;
    use std::net::{IpAddr, TcpListener};
    use std::thread::JoinHandle;

    fn endpoint_of(addr: std::net::SocketAddr) -> Endpoint {
        match addr.ip() {
            IpAddr::V4(v4) => Endpoint::new(v4, addr.port()),
            IpAddr::V6(_) => unreachable!("tests only bind to 127.0.0.1"),
        }
    }

    fn full_bitfield(num_pieces: usize) -> Vec<u8> {
        vec![0xFFu8; (num_pieces + 7) / 8]
    }

    /// Accepts one connection, completes the handshake and bitfield intake
    /// with every piece marked present, then serves `Request`s against
    /// `content` until the socket closes.
    fn spawn_full_peer(
        listener: TcpListener,
        content: Vec<u8>,
        piece_length: usize,
        num_pieces: usize,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let incoming = Handshake::read_from(&mut sock).unwrap();
            Handshake::new(incoming.info_hash, [9u8; 20])
                .write_to(&mut sock)
                .unwrap();
            Message::Bitfield(full_bitfield(num_pieces))
                .write_to(&mut sock)
                .unwrap();

            let _ = Message::read_from(&mut sock).unwrap(); // Unchoke from the worker
            let _ = Message::read_from(&mut sock).unwrap(); // Interested from the worker
            Message::Unchoke.write_to(&mut sock).unwrap();

            loop {
                match Message::read_from(&mut sock) {
                    Ok(Some(Message::Request {
                        index,
                        begin,
                        length,
                    })) => {
                        let start = index as usize * piece_length + begin as usize;
                        let end = start + length as usize;
                        let block = content[start..end].to_vec();
                        Message::Piece {
                            index,
                            begin,
                            block,
                        }
                        .write_to(&mut sock)
                        .unwrap();
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        })
    }

    #[test]
    fn full_download_reassembles_three_pieces_correctly() {
        let piece_length = 20_000usize;
        let total_length = 50_000usize;
        let num_pieces = 3usize;

        let mut content = vec![0u8; total_length];
        for (i, b) in content.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let piece_hashes: Vec<[u8; 20]> = (0..num_pieces)
            .map(|i| {
                let begin = i * piece_length;
                let end = ((i + 1) * piece_length).min(total_length);
                let mut hasher = Sha1::new();
                hasher.update(&content[begin..end]);
                hasher.finalize().into()
            })
            .collect();

        let torrent = Torrent {
            announce: "http://tracker.example/announce".to_string(),
            announce_list: Vec::new(),
            info_hash: [7u8; 20],
            piece_hashes,
            piece_length: piece_length as u64,
            length: total_length as u64,
            name: "sample".to_string(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = spawn_full_peer(listener, content.clone(), piece_length, num_pieces);

        let result = run(&torrent, vec![endpoint_of(addr)], [1u8; 20]).unwrap();
        assert_eq!(result, content);
        handle.join().unwrap();
    }

    #[test]
    fn fetch_piece_validates_against_the_expected_hash() {
        let piece_length = 4096usize;
        let mut content = vec![0u8; piece_length];
        for (i, b) in content.iter_mut().enumerate() {
            *b = (i * 7 % 256) as u8;
        }

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let content_clone = content.clone();
        let handle = spawn_full_peer(listener, content_clone, piece_length, 1);

        let endpoint = endpoint_of(addr);
        let mut conn = Connection::connect(endpoint, [1u8; 20], [9u8; 20]).unwrap();
        conn.send_unchoke().unwrap();
        conn.send_interested().unwrap();

        let job = Job {
            index: 0,
            hash: [0u8; 20], // deliberately wrong
            length: piece_length,
        };
        let buffer = fetch_piece(&mut conn, &job).unwrap();
        assert_eq!(buffer, content);
        assert!(!piece_hash_matches(&buffer, &job.hash));

        drop(conn);
        handle.join().unwrap();
    }

    #[test]
    fn fetch_piece_sends_no_requests_while_choked() {
        let piece_length = 5 * BLOCK_SIZE;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let unchoke_delay = Duration::from_millis(300);

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let incoming = Handshake::read_from(&mut sock).unwrap();
            Handshake::new(incoming.info_hash, [9u8; 20])
                .write_to(&mut sock)
                .unwrap();
            Message::Bitfield(full_bitfield(1)).write_to(&mut sock).unwrap();
            let _ = Message::read_from(&mut sock).unwrap();
            let _ = Message::read_from(&mut sock).unwrap();

            sock.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
            let mut saw_request_before_unchoke = false;
            let started = std::time::Instant::now();
            while started.elapsed() < unchoke_delay {
                match Message::read_from(&mut sock) {
                    Ok(Some(Message::Request { .. })) => saw_request_before_unchoke = true,
                    _ => {}
                }
            }
            assert!(!saw_request_before_unchoke);

            Message::Unchoke.write_to(&mut sock).unwrap();

            sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut requests_seen = 0;
            for _ in 0..MAX_PENDING {
                if let Ok(Some(Message::Request {
                    index,
                    begin,
                    length,
                })) = Message::read_from(&mut sock)
                {
                    requests_seen += 1;
                    let block = vec![0u8; length as usize];
                    Message::Piece {
                        index,
                        begin,
                        block,
                    }
                    .write_to(&mut sock)
                    .unwrap();
                }
            }
            assert_eq!(requests_seen, MAX_PENDING);
        });

        let mut conn = Connection::connect(endpoint_of(addr), [1u8; 20], [9u8; 20]).unwrap();
        conn.send_unchoke().unwrap();
        conn.send_interested().unwrap();

        let job = Job {
            index: 0,
            hash: [0u8; 20],
            length: piece_length,
        };
        let _ = fetch_piece(&mut conn, &job);

        server.join().unwrap();
    }
}
