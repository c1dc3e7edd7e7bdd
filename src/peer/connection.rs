//! TCP connect + handshake + bitfield intake, and the send/receive surface a
//! piece-fetch worker drives thereafter.
//!
//! A `Connection` is owned exclusively by the worker thread that created it:
//! no other thread reads or writes its socket or its copy of the peer's
//! bitmap, so no locking is needed around it (see `engine.rs`).

use crate::bitfield::Bitmap;
use crate::endpoint::Endpoint;
use crate::peer::handshake::{Handshake, HandshakeError};
use crate::peer::message::{self, FrameError, Message};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("info hash mismatch")]
    InfoHashMismatch,
    #[error("expected a bitfield frame immediately after the handshake")]
    BitfieldExpected,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub struct Connection {
    stream: TcpStream,
    pub peer: Endpoint,
    pub peer_id: [u8; 20],
    pub choked: bool,
    pub bitmap: Bitmap,
}

impl Connection {
    /// Dials `endpoint`, performs the handshake, and reads the peer's
    /// bitfield. Any other frame type arriving first (including a
    /// keep-alive or a choke/unchoke/have) is fatal for this peer.
    pub fn connect(
        endpoint: Endpoint,
        local_peer_id: [u8; 20],
        info_hash: [u8; 20],
    ) -> Result<Connection, ConnectError> {
        let addr = SocketAddr::from((endpoint.addr, endpoint.port));
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;

        stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        Handshake::new(info_hash, local_peer_id).write_to(&mut stream)?;
        let reply = Handshake::read_from(&mut stream)?;
        if !reply.matches_info_hash(&info_hash) {
            return Err(ConnectError::InfoHashMismatch);
        }

        stream.set_read_timeout(Some(BITFIELD_TIMEOUT))?;
        let bitmap = match Message::read_from(&mut stream)? {
            Some(Message::Bitfield(bits)) => Bitmap::from_bytes(bits),
            _ => return Err(ConnectError::BitfieldExpected),
        };

        // Read/write deadlines for the rest of the connection's life are
        // managed by the fetch loop (30s per piece), not here.
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;

        Ok(Connection {
            stream,
            peer: endpoint,
            peer_id: reply.peer_id,
            choked: true,
            bitmap,
        })
    }

    pub fn set_piece_deadline(&mut self, deadline: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(deadline))?;
        self.stream.set_write_timeout(Some(deadline))?;
        Ok(())
    }

    pub fn read(&mut self) -> Result<Option<Message>, FrameError> {
        Message::read_from(&mut self.stream)
    }

    fn send(&mut self, msg: &Message) -> io::Result<()> {
        msg.write_to(&mut self.stream)
    }

    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> io::Result<()> {
        self.send(&message::build_request(index, begin, length))
    }

    pub fn send_interested(&mut self) -> io::Result<()> {
        self.send(&Message::Interested)
    }

    pub fn send_not_interested(&mut self) -> io::Result<()> {
        self.send(&Message::NotInterested)
    }

    pub fn send_unchoke(&mut self) -> io::Result<()> {
        self.send(&Message::Unchoke)
    }

    pub fn send_have(&mut self, index: u32) -> io::Result<()> {
        self.send(&message::build_have(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn connect_performs_handshake_then_reads_bitfield() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [3u8; 20];
        let remote_peer_id = [4u8; 20];

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let incoming = Handshake::read_from(&mut sock).unwrap();
            assert_eq!(incoming.info_hash, info_hash);
            Handshake::new(info_hash, remote_peer_id)
                .write_to(&mut sock)
                .unwrap();
            let bitfield = Message::Bitfield(vec![0b1000_0000]);
            sock.write_all(&bitfield.pack()).unwrap();
        });

        let endpoint = Endpoint::new(
            match addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            addr.port(),
        );
        let conn = Connection::connect(endpoint, [1u8; 20], info_hash).unwrap();
        assert!(conn.choked);
        assert!(conn.bitmap.check(0));
        assert_eq!(conn.peer_id, remote_peer_id);

        server.join().unwrap();
    }

    #[test]
    fn mismatched_info_hash_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _ = Handshake::read_from(&mut sock).unwrap();
            Handshake::new([0xffu8; 20], [4u8; 20])
                .write_to(&mut sock)
                .unwrap();
        });

        let endpoint = Endpoint::new(
            match addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            addr.port(),
        );
        let err = Connection::connect(endpoint, [1u8; 20], [1u8; 20]).unwrap_err();
        assert!(matches!(err, ConnectError::InfoHashMismatch));

        server.join().unwrap();
    }

    #[test]
    fn non_bitfield_frame_after_handshake_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [5u8; 20];

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _ = Handshake::read_from(&mut sock).unwrap();
            Handshake::new(info_hash, [4u8; 20])
                .write_to(&mut sock)
                .unwrap();
            sock.write_all(&Message::Unchoke.pack()).unwrap();
        });

        let endpoint = Endpoint::new(
            match addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            addr.port(),
        );
        let err = Connection::connect(endpoint, [1u8; 20], info_hash).unwrap_err();
        assert!(matches!(err, ConnectError::BitfieldExpected));

        server.join().unwrap();
    }
}
