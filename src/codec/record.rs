//! Decode/encode for the incremental tree-update record stream carried inside
//! `DATA_UPDATE` frames. Mirrors `src/pypipboy/dataparser.py::DataUpdateParser`
//! and `src/pypipboy/dataencoder.py::DataUpdateEncoder` byte for byte.

use crate::error::{Error, Result};
use crate::wire;
use std::io::Cursor;

/// Value type tag as it appears on the wire. There is no 16-bit variant here
/// even though `wire` exposes 16-bit primitives generally — the original
/// protocol's `eValueType` enum never uses one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int8,
    UInt8,
    Int32,
    UInt32,
    Float,
    String,
    Array,
    Object,
}

impl ValueType {
    fn from_code(code: u8) -> Result<ValueType> {
        Ok(match code {
            0 => ValueType::Bool,
            1 => ValueType::Int8,
            2 => ValueType::UInt8,
            3 => ValueType::Int32,
            4 => ValueType::UInt32,
            5 => ValueType::Float,
            6 => ValueType::String,
            7 => ValueType::Array,
            8 => ValueType::Object,
            other => return Err(Error::UnknownValueType(other)),
        })
    }

    fn code(self) -> u8 {
        match self {
            ValueType::Bool => 0,
            ValueType::Int8 => 1,
            ValueType::UInt8 => 2,
            ValueType::Int32 => 3,
            ValueType::UInt32 => 4,
            ValueType::Float => 5,
            ValueType::String => 6,
            ValueType::Array => 7,
            ValueType::Object => 8,
        }
    }
}

/// A scalar or structural payload carried by one `Record`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int32(i32),
    UInt32(u32),
    Float(f32),
    String(String),
    Array(Vec<u32>),
    Object {
        added: Vec<(String, u32)>,
        removed: Vec<u32>,
    },
}

impl RecordPayload {
    pub fn value_type(&self) -> ValueType {
        match self {
            RecordPayload::Bool(_) => ValueType::Bool,
            RecordPayload::Int8(_) => ValueType::Int8,
            RecordPayload::UInt8(_) => ValueType::UInt8,
            RecordPayload::Int32(_) => ValueType::Int32,
            RecordPayload::UInt32(_) => ValueType::UInt32,
            RecordPayload::Float(_) => ValueType::Float,
            RecordPayload::String(_) => ValueType::String,
            RecordPayload::Array(_) => ValueType::Array,
            RecordPayload::Object { .. } => ValueType::Object,
        }
    }
}

/// One `(id, type, payload)` triple from the record stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: u32,
    pub payload: RecordPayload,
}

/// Decodes every record in `data`, invoking `sink` for each in on-wire order.
///
/// Returns `Error::TrailingGarbage` if the cursor does not land exactly on the
/// end of `data` after the last record.
pub fn decode_records(data: &[u8], mut sink: impl FnMut(Record)) -> Result<()> {
    let mut cursor = Cursor::new(data);
    let len = data.len() as u64;

    while cursor.position() < len {
        let type_code = wire::read_u8(&mut cursor)?;
        let value_type = ValueType::from_code(type_code)?;
        let id = wire::read_u32(&mut cursor)?;
        let payload = decode_payload(&mut cursor, value_type)?;
        sink(Record { id, payload });
    }

    if cursor.position() != len {
        return Err(Error::TrailingGarbage((len - cursor.position()) as usize));
    }

    Ok(())
}

fn decode_payload(cursor: &mut Cursor<&[u8]>, value_type: ValueType) -> Result<RecordPayload> {
    Ok(match value_type {
        ValueType::Bool => RecordPayload::Bool(wire::read_bool(cursor)?),
        ValueType::Int8 => RecordPayload::Int8(wire::read_i8(cursor)?),
        ValueType::UInt8 => RecordPayload::UInt8(wire::read_u8(cursor)?),
        ValueType::Int32 => RecordPayload::Int32(wire::read_i32(cursor)?),
        ValueType::UInt32 => RecordPayload::UInt32(wire::read_u32(cursor)?),
        ValueType::Float => RecordPayload::Float(wire::read_f32(cursor)?),
        ValueType::String => RecordPayload::String(wire::read_cstring(cursor)?),
        ValueType::Array => {
            let count = wire::read_u16(cursor)? as usize;
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(wire::read_u32(cursor)?);
            }
            RecordPayload::Array(ids)
        }
        ValueType::Object => {
            let added_count = wire::read_u16(cursor)? as usize;
            let mut added = Vec::with_capacity(added_count);
            for _ in 0..added_count {
                let id = wire::read_u32(cursor)?;
                let key = wire::read_cstring(cursor)?;
                added.push((key, id));
            }
            let removed_count = wire::read_u16(cursor)? as usize;
            let mut removed = Vec::with_capacity(removed_count);
            for _ in 0..removed_count {
                removed.push(wire::read_u32(cursor)?);
            }
            RecordPayload::Object { added, removed }
        }
    })
}

/// Encodes one record. Object payloads always emit a zero removed-count,
/// matching the original encoder — this makes encode lossy relative to
/// decode for objects with pending removals, which is intentional for the
/// snapshot use case (see the relay's initial `DATA_UPDATE`).
pub fn encode_record(out: &mut Vec<u8>, record: &Record) {
    wire::write_u8(out, record.payload.value_type().code());
    wire::write_u32(out, record.id);

    match &record.payload {
        RecordPayload::Bool(v) => wire::write_bool(out, *v),
        RecordPayload::Int8(v) => wire::write_i8(out, *v),
        RecordPayload::UInt8(v) => wire::write_u8(out, *v),
        RecordPayload::Int32(v) => wire::write_i32(out, *v),
        RecordPayload::UInt32(v) => wire::write_u32(out, *v),
        RecordPayload::Float(v) => wire::write_f32(out, *v),
        RecordPayload::String(v) => wire::write_cstring(out, v),
        RecordPayload::Array(ids) => {
            wire::write_u16(out, ids.len() as u16);
            for id in ids {
                wire::write_u32(out, *id);
            }
        }
        RecordPayload::Object { added, .. } => {
            wire::write_u16(out, added.len() as u16);
            for (key, id) in added {
                wire::write_u32(out, *id);
                wire::write_cstring(out, key);
            }
            wire::write_u16(out, 0);
        }
    }
}

pub fn encode_records(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        encode_record(&mut out, record);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_scalar_and_array_and_object() {
        let records = vec![
            Record {
                id: 1,
                payload: RecordPayload::UInt32(42),
            },
            Record {
                id: 2,
                payload: RecordPayload::Array(vec![10, 11, 12]),
            },
            Record {
                id: 0,
                payload: RecordPayload::Object {
                    added: vec![("a".into(), 1), ("b".into(), 2)],
                    removed: vec![],
                },
            },
        ];

        let encoded = encode_records(&records);
        let mut decoded = Vec::new();
        decode_records(&encoded, |record| decoded.push(record)).unwrap();

        assert_eq!(decoded, records);
    }

    #[test]
    fn object_encode_always_zeroes_removed_count() {
        let record = Record {
            id: 0,
            payload: RecordPayload::Object {
                added: vec![],
                removed: vec![7, 8],
            },
        };
        let encoded = encode_records(&[record]);

        let mut decoded = Vec::new();
        decode_records(&encoded, |r| decoded.push(r)).unwrap();
        match &decoded[0].payload {
            RecordPayload::Object { removed, .. } => assert!(removed.is_empty()),
            _ => panic!("expected object payload"),
        }
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let bytes = vec![0xffu8, 0, 0, 0, 0];
        let err = decode_records(&bytes, |_| {}).unwrap_err();
        assert!(matches!(err, Error::UnknownValueType(0xff)));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut encoded = encode_records(&[Record {
            id: 1,
            payload: RecordPayload::Bool(true),
        }]);
        encoded.push(0xaa);
        let err = decode_records(&encoded, |_| {}).unwrap_err();
        assert!(matches!(err, Error::TrailingGarbage(1)));
    }
}
