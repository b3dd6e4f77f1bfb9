//! Wire framing for the node protocol.
//!
//! Every message starts with a fixed 12-byte header: `type: u32` followed by
//! `length: u64`, both little-endian. The meaning of `length` depends on the
//! message type:
//!
//! - `Read` request: path bytes that follow; response: node file size (0 if
//!   the file is not openable)
//! - `WritePath` request: path bytes that follow; no response
//! - `Write` request: payload bytes that follow (at most one chunk); no
//!   response
//! - `Heartbeat`: opaque correlation id, echoed verbatim
//!
//! Payloads are raw bytes; paths are not NUL-terminated, the length prefix is
//! authoritative. EOF or a short read inside a frame means the peer is dead.

use std::io::{self, Read, Write};

/// Default chunk size: the unit of striping and transport (1 MiB).
pub const CHUNK_SIZE: usize = 1 << 20;

/// Size of the encoded message header on the wire.
pub const HEADER_SIZE: usize = 12;

/// Message types of the node protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Read = 0,
    WritePath = 1,
    Write = 2,
    Heartbeat = 3,
}

impl MessageType {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(MessageType::Read),
            1 => Some(MessageType::WritePath),
            2 => Some(MessageType::Write),
            3 => Some(MessageType::Heartbeat),
            _ => None,
        }
    }
}

/// Fixed-layout message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageType,
    pub length: u64,
}

impl MessageHeader {
    pub fn new(kind: MessageType, length: u64) -> Self {
        Self { kind, length }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[4..].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> io::Result<Self> {
        let raw = u32::from_le_bytes(buf[..4].try_into().unwrap());
        let kind = MessageType::from_u32(raw).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message type {raw}"),
            )
        })?;
        let length = u64::from_le_bytes(buf[4..].try_into().unwrap());
        Ok(Self { kind, length })
    }
}

/// Read one header, blocking until it is complete.
///
/// EOF before the first byte and EOF mid-header are both errors here; use
/// [`read_header_opt`] where a clean close is expected.
pub fn read_header(r: &mut impl Read) -> io::Result<MessageHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    r.read_exact(&mut buf)?;
    MessageHeader::decode(&buf)
}

/// Read one header, returning `None` on a clean EOF at a frame boundary.
///
/// EOF after a partial header is still an error: the peer died mid-frame.
pub fn read_header_opt(r: &mut impl Read) -> io::Result<Option<MessageHeader>> {
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof inside message header",
            ));
        }
        filled += n;
    }
    MessageHeader::decode(&buf).map(Some)
}

pub fn write_header(w: &mut impl Write, header: &MessageHeader) -> io::Result<()> {
    w.write_all(&header.encode())
}

/// Send a header followed by its payload in one call.
pub fn send_frame(w: &mut impl Write, kind: MessageType, payload: &[u8]) -> io::Result<()> {
    write_header(w, &MessageHeader::new(kind, payload.len() as u64))?;
    w.write_all(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = MessageHeader::new(MessageType::Write, CHUNK_SIZE as u64);
        let decoded = MessageHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn encoding_is_little_endian() {
        let header = MessageHeader::new(MessageType::Heartbeat, 0x0102_0304);
        let buf = header.encode();
        assert_eq!(&buf[..4], &[3, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[4, 3, 2, 1]);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&7u32.to_le_bytes());
        assert!(MessageHeader::decode(&buf).is_err());
    }

    #[test]
    fn clean_eof_yields_none() {
        let empty: &[u8] = &[];
        assert!(read_header_opt(&mut &*empty).unwrap().is_none());
    }

    #[test]
    fn partial_header_is_an_error() {
        let partial: &[u8] = &[0, 0, 0];
        let err = read_header_opt(&mut &*partial).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn frame_carries_payload() {
        let mut buf = Vec::new();
        send_frame(&mut buf, MessageType::WritePath, b"/a.bin").unwrap();
        let header = read_header(&mut &buf[..]).unwrap();
        assert_eq!(header.kind, MessageType::WritePath);
        assert_eq!(header.length, 6);
        assert_eq!(&buf[HEADER_SIZE..], b"/a.bin");
    }
}
