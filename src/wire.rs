//! Fixed-width little-endian primitive encode/decode.
//!
//! Decoding reads from an `io::Cursor<&[u8]>`; a short buffer is reported as
//! `Error::Truncated` with byte counts rather than a bare `io::ErrorKind::UnexpectedEof`.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len() - cursor.position() as usize
}

fn require(cursor: &Cursor<&[u8]>, needed: usize) -> Result<()> {
    let available = remaining(cursor);
    if available < needed {
        Err(Error::Truncated { needed, available })
    } else {
        Ok(())
    }
}

pub fn read_bool(cursor: &mut Cursor<&[u8]>) -> Result<bool> {
    require(cursor, 1)?;
    Ok(cursor.read_u8()? != 0)
}

pub fn read_i8(cursor: &mut Cursor<&[u8]>) -> Result<i8> {
    require(cursor, 1)?;
    Ok(cursor.read_i8()?)
}

pub fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    require(cursor, 1)?;
    Ok(cursor.read_u8()?)
}

pub fn read_i16(cursor: &mut Cursor<&[u8]>) -> Result<i16> {
    require(cursor, 2)?;
    Ok(cursor.read_i16::<LittleEndian>()?)
}

pub fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    require(cursor, 2)?;
    Ok(cursor.read_u16::<LittleEndian>()?)
}

pub fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    require(cursor, 4)?;
    Ok(cursor.read_i32::<LittleEndian>()?)
}

pub fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    require(cursor, 4)?;
    Ok(cursor.read_u32::<LittleEndian>()?)
}

pub fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32> {
    require(cursor, 4)?;
    Ok(cursor.read_f32::<LittleEndian>()?)
}

/// Reads a NUL-terminated string. Invalid byte sequences are replaced lossily
/// rather than rejected, matching the original decoder's lenient strategy.
pub fn read_cstring(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let start = cursor.position() as usize;
    let bytes = *cursor.get_ref();
    let end = bytes[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|offset| start + offset);

    match end {
        Some(end) => {
            let s = String::from_utf8_lossy(&bytes[start..end]).into_owned();
            cursor.set_position((end + 1) as u64);
            Ok(s)
        }
        None => Err(Error::Truncated {
            needed: 1,
            available: 0,
        }),
    }
}

pub fn write_bool(out: &mut Vec<u8>, value: bool) {
    out.write_u8(if value { 1 } else { 0 }).unwrap();
}

pub fn write_i8(out: &mut Vec<u8>, value: i8) {
    out.write_i8(value).unwrap();
}

pub fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.write_u8(value).unwrap();
}

pub fn write_i16(out: &mut Vec<u8>, value: i16) {
    out.write_i16::<LittleEndian>(value).unwrap();
}

pub fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.write_u16::<LittleEndian>(value).unwrap();
}

pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.write_i32::<LittleEndian>(value).unwrap();
}

pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.write_u32::<LittleEndian>(value).unwrap();
}

pub fn write_f32(out: &mut Vec<u8>, value: f32) {
    out.write_f32::<LittleEndian>(value).unwrap();
}

pub fn write_cstring(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_scalars() {
        let mut buf = Vec::new();
        write_bool(&mut buf, true);
        write_i32(&mut buf, -42);
        write_u32(&mut buf, 42);
        write_f32(&mut buf, 1.5);
        write_cstring(&mut buf, "hello");

        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(read_bool(&mut cursor).unwrap(), true);
        assert_eq!(read_i32(&mut cursor).unwrap(), -42);
        assert_eq!(read_u32(&mut cursor).unwrap(), 42);
        assert_eq!(read_f32(&mut cursor).unwrap(), 1.5);
        assert_eq!(read_cstring(&mut cursor).unwrap(), "hello");
    }

    #[test]
    fn truncated_read_reports_counts() {
        let buf = vec![0u8; 2];
        let mut cursor = Cursor::new(&buf[..]);
        let err = read_u32(&mut cursor).unwrap_err();
        match err {
            Error::Truncated { needed, available } => {
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn unterminated_string_is_truncated() {
        let buf = vec![b'h', b'i'];
        let mut cursor = Cursor::new(&buf[..]);
        assert!(read_cstring(&mut cursor).is_err());
    }
}
