//! Length-prefixed peer wire frames: 4-byte big-endian length, then (unless
//! the length is zero, a keep-alive) one byte of type and the remaining
//! payload.

use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame type")]
    InvalidType,
    #[error("payload too short")]
    PayloadTooShort,
    #[error("piece index mismatch")]
    IndexMismatch,
    #[error("block offset too high")]
    OffsetTooHigh,
    #[error("block data too long")]
    DataTooLong,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    fn type_tag(&self) -> u8 {
        match self {
            Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request { .. } => 6,
            Message::Piece { .. } => 7,
            Message::Cancel { .. } => 8,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                Vec::new()
            }
            Message::Have(index) => index.to_be_bytes().to_vec(),
            Message::Bitfield(bits) => bits.clone(),
            Message::Request {
                index,
                begin,
                length,
            } => request_payload(*index, *begin, *length),
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let mut buf = Vec::with_capacity(8 + block.len());
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => request_payload(*index, *begin, *length),
        }
    }

    /// Packs a non-keep-alive frame to its wire form: `length(1+|payload|) ||
    /// type || payload`.
    pub fn pack(&self) -> Vec<u8> {
        let payload = self.payload();
        let len = 1 + payload.len() as u32;
        let mut buf = Vec::with_capacity(4 + len as usize);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(self.type_tag());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Wire form of the keep-alive: `[0, 0, 0, 0]`.
    pub fn pack_keepalive() -> Vec<u8> {
        vec![0, 0, 0, 0]
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.pack())
    }

    /// Reads one frame. `Ok(None)` is a keep-alive. I/O errors (including a
    /// partial read) propagate from the underlying reader.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Message>, FrameError> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return Ok(None);
        }

        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body)?;
        let tag = body[0];
        let data = &body[1..];

        let msg = match tag {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if data.len() != 4 {
                    return Err(FrameError::PayloadTooShort);
                }
                Message::Have(u32::from_be_bytes(data.try_into().unwrap()))
            }
            5 => Message::Bitfield(data.to_vec()),
            6 => {
                let (index, begin, length) = read_three_u32(data)?;
                Message::Request {
                    index,
                    begin,
                    length,
                }
            }
            7 => {
                if data.len() < 8 {
                    return Err(FrameError::PayloadTooShort);
                }
                let index = u32::from_be_bytes(data[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(data[4..8].try_into().unwrap());
                Message::Piece {
                    index,
                    begin,
                    block: data[8..].to_vec(),
                }
            }
            8 => {
                let (index, begin, length) = read_three_u32(data)?;
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
            _ => return Err(FrameError::InvalidType),
        };
        Ok(Some(msg))
    }
}

fn read_three_u32(data: &[u8]) -> Result<(u32, u32, u32), FrameError> {
    if data.len() != 12 {
        return Err(FrameError::PayloadTooShort);
    }
    let index = u32::from_be_bytes(data[0..4].try_into().unwrap());
    let begin = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let length = u32::from_be_bytes(data[8..12].try_into().unwrap());
    Ok((index, begin, length))
}

/// 12-byte `Request`/`Cancel` payload: big-endian `(index, begin, length)`.
pub fn request_payload(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&begin.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf
}

pub fn build_request(index: u32, begin: u32, length: u32) -> Message {
    Message::Request {
        index,
        begin,
        length,
    }
}

pub fn build_have(index: u32) -> Message {
    Message::Have(index)
}

/// Validates and extracts the piece index from a `Have` frame.
pub fn read_have(msg: &Message) -> Result<u32, FrameError> {
    match msg {
        Message::Have(index) => Ok(*index),
        _ => Err(FrameError::InvalidType),
    }
}

/// Validates a `Piece` frame against `target` and `expected_index`, copies
/// the block into `target[offset..]`, and returns the number of bytes
/// written.
pub fn read_piece_data(
    target: &mut [u8],
    expected_index: u32,
    msg: &Message,
) -> Result<usize, FrameError> {
    let (index, begin, block) = match msg {
        Message::Piece {
            index,
            begin,
            block,
        } => (*index, *begin, block),
        _ => return Err(FrameError::InvalidType),
    };

    if index != expected_index {
        return Err(FrameError::IndexMismatch);
    }

    let offset = begin as usize;
    if offset >= target.len() {
        return Err(FrameError::OffsetTooHigh);
    }
    if offset + block.len() > target.len() {
        return Err(FrameError::DataTooLong);
    }

    target[offset..offset + block.len()].copy_from_slice(block);
    Ok(block.len())
}
