//! Frame header encode/decode: a 4-byte little-endian payload length, a
//! 1-byte message type, then the payload itself. Field layout is grounded on
//! `t51core/src/net/frame.rs::Header`; message semantics follow
//! `pypipboy/network.py::NetworkMessage` and `src/pypipboy/types.py::eMessageType`.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const HEADER_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    KeepAlive,
    ConnectionAccepted,
    ConnectionRefused,
    DataUpdate,
    LocalMapUpdate,
    Command,
    CommandResult,
}

impl MessageType {
    pub fn from_code(code: u8) -> Result<MessageType> {
        Ok(match code {
            0 => MessageType::KeepAlive,
            1 => MessageType::ConnectionAccepted,
            2 => MessageType::ConnectionRefused,
            3 => MessageType::DataUpdate,
            4 => MessageType::LocalMapUpdate,
            5 => MessageType::Command,
            6 => MessageType::CommandResult,
            other => return Err(Error::TransportError(format!("unknown message type code {}", other))),
        })
    }

    pub fn code(self) -> u8 {
        match self {
            MessageType::KeepAlive => 0,
            MessageType::ConnectionAccepted => 1,
            MessageType::ConnectionRefused => 2,
            MessageType::DataUpdate => 3,
            MessageType::LocalMapUpdate => 4,
            MessageType::Command => 5,
            MessageType::CommandResult => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn keep_alive() -> Frame {
        Frame {
            message_type: MessageType::KeepAlive,
            payload: Vec::new(),
        }
    }

    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Frame {
        Frame {
            message_type,
            payload,
        }
    }
}

/// Reads exactly one frame, blocking until the header and full payload have
/// arrived. A short read surfaces as `Error::Io` with `UnexpectedEof`, which
/// the caller (the receive loop) treats as a transport failure.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let length = reader.read_u32::<LittleEndian>()? as usize;
    let type_code = reader.read_u8()?;
    let message_type = MessageType::from_code(type_code)?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;

    Ok(Frame {
        message_type,
        payload,
    })
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_u32::<LittleEndian>(frame.payload.len() as u32)?;
    writer.write_u8(frame.message_type.code())?;
    writer.write_all(&frame.payload)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_frame() {
        let frame = Frame::new(MessageType::Command, vec![1, 2, 3, 4]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn keep_alive_has_empty_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::keep_alive()).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::new(MessageType::DataUpdate, vec![1, 2, 3])).unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }
}
