//! Encode/decode engine.
//!
//! The only code that touches raw frame bytes. Everything here is pure: given
//! a schema, the same bytes always decode to the same record. Length checks
//! happen before any field is read, so the `Buf` getters below never run past
//! the end of a slice.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::CodecError;
use super::schema::{FieldKind, IntWidth, PacketSchema, SizeField};
use super::value::{Record, Value};

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Field values in schema order. Size prefixes are included as read.
    pub record: Record,
    /// Trailing counter byte for sequenced schemas.
    pub sequence: Option<u8>,
}

/// Encode `record` as one frame of `schema`.
///
/// `sequence` must be present exactly when the schema is sequenced. Size
/// prefixes are always recomputed; a value supplied for one is ignored.
pub fn encode(
    schema: &PacketSchema,
    record: &Record,
    sequence: Option<u8>,
) -> Result<Bytes, CodecError> {
    let name = schema.name();
    if schema.has_sequence() != sequence.is_some() {
        return Err(CodecError::mismatch(
            name,
            format!("sequenced={} but counter given={}", schema.has_sequence(), sequence.is_some()),
        ));
    }

    for (field, _) in record.iter() {
        if !schema.fields().iter().any(|f| f.name == field) {
            return Err(CodecError::mismatch(name, format!("unexpected field '{field}'")));
        }
    }

    let trailing_len = match schema.fields().iter().find(|f| f.kind.is_dynamic()) {
        Some(f) => trailing_bytes(name, f.name, record.get(f.name))?.len(),
        None => 0,
    };

    let mut buf = BytesMut::with_capacity(schema.min_size() + trailing_len);
    buf.put_u8(schema.header());
    if let Some(sub) = schema.sub_header() {
        buf.put_u8(sub);
    }

    for f in schema.fields() {
        if f.is_size_prefix() {
            let FieldKind::Int(width) = f.kind else {
                return Err(CodecError::mismatch(name, format!("size field '{}' is not an integer", f.name)));
            };
            put_int(&mut buf, name, f.name, width, trailing_len as u64)?;
            continue;
        }
        let value = record
            .get(f.name)
            .ok_or_else(|| CodecError::mismatch(name, format!("missing field '{}'", f.name)))?;
        encode_field(&mut buf, name, f.name, &f.kind, value)?;
    }

    if let Some(seq) = sequence {
        buf.put_u8(seq);
    }
    Ok(buf.freeze())
}

/// Decode one complete frame of `schema`.
///
/// The buffer must hold exactly one frame: shorter than the minimum is
/// [`CodecError::TruncatedFrame`], a declared trailing size that does not
/// match the remaining bytes is [`CodecError::InvalidLength`].
pub fn decode(schema: &PacketSchema, frame: &[u8]) -> Result<Decoded, CodecError> {
    let name = schema.name();
    let min = schema.min_size();
    if frame.len() < min {
        return Err(CodecError::TruncatedFrame {
            header: schema.header(),
            need: min,
            got: frame.len(),
        });
    }
    if frame[0] != schema.header() || (schema.sub_header().is_some() && Some(frame[1]) != schema.sub_header()) {
        return Err(CodecError::mismatch(
            name,
            format!("frame header {:#04X} does not belong to this schema", frame[0]),
        ));
    }

    let declared = match schema.size_field() {
        Some(sf) => read_uint(frame, sf) as usize,
        None => 0,
    };
    let available = frame.len() - min;
    if declared != available {
        return Err(CodecError::InvalidLength {
            header: schema.header(),
            declared,
            available,
        });
    }

    let mut cur = &frame[schema.header_len()..];
    let mut record = Record::new();
    for f in schema.fields() {
        let value = match f.kind {
            FieldKind::DynamicBytes => {
                let raw = cur[..declared].to_vec();
                cur.advance(declared);
                Value::Bytes(raw)
            }
            FieldKind::DynamicString => {
                let raw = String::from_utf8_lossy(&cur[..declared]).into_owned();
                cur.advance(declared);
                Value::Str(raw)
            }
            ref kind => decode_field(&mut cur, kind),
        };
        record.set(f.name, value);
    }

    let sequence = schema.has_sequence().then(|| cur.get_u8());
    Ok(Decoded { record, sequence })
}

/// Total length of the frame starting at `buf[0]`, if it can be known yet.
///
/// Static schemas answer immediately. Dynamic schemas need the size prefix to
/// be buffered first and return `Ok(None)` until it is. Declared sizes that
/// would push the frame past `max_frame` are rejected before any payload is
/// buffered.
pub fn frame_len(schema: &PacketSchema, buf: &[u8], max_frame: usize) -> Result<Option<usize>, CodecError> {
    let Some(sf) = schema.size_field() else {
        return Ok(Some(schema.min_size()));
    };
    if buf.len() < sf.offset + sf.width.bytes() {
        return Ok(None);
    }
    let declared = read_uint(buf, sf);
    let total = (schema.min_size() as u64).saturating_add(declared);
    if total > max_frame as u64 {
        return Err(CodecError::InvalidLength {
            header: schema.header(),
            declared: usize::try_from(declared).unwrap_or(usize::MAX),
            available: max_frame.saturating_sub(schema.min_size()),
        });
    }
    Ok(Some(total as usize))
}

fn read_uint(buf: &[u8], sf: SizeField) -> u64 {
    let n = sf.width.bytes();
    (&buf[sf.offset..sf.offset + n]).get_uint_le(n)
}

fn trailing_bytes<'a>(
    schema: &'static str,
    field: &'static str,
    value: Option<&'a Value>,
) -> Result<&'a [u8], CodecError> {
    match value {
        Some(Value::Bytes(b)) => Ok(b),
        Some(Value::Str(s)) => Ok(s.as_bytes()),
        Some(other) => Err(CodecError::mismatch(
            schema,
            format!("field '{field}' expects trailing data, got {}", other.kind_name()),
        )),
        None => Err(CodecError::mismatch(schema, format!("missing field '{field}'"))),
    }
}

fn put_int(
    buf: &mut BytesMut,
    schema: &'static str,
    field: &'static str,
    width: IntWidth,
    v: u64,
) -> Result<(), CodecError> {
    if v > width.max() {
        return Err(CodecError::mismatch(
            schema,
            format!("field '{field}' value {v} exceeds {}-byte width", width.bytes()),
        ));
    }
    buf.put_uint_le(v, width.bytes());
    Ok(())
}

fn encode_field(
    buf: &mut BytesMut,
    schema: &'static str,
    field: &'static str,
    kind: &FieldKind,
    value: &Value,
) -> Result<(), CodecError> {
    let wrong = || {
        CodecError::mismatch(
            schema,
            format!("field '{field}' got {} for {kind:?}", value.kind_name()),
        )
    };
    match kind {
        FieldKind::Int(width) => put_int(buf, schema, field, *width, value.as_int().ok_or_else(wrong)?),
        FieldKind::FixedString(len) => {
            let s = value.as_str().ok_or_else(wrong)?.as_bytes();
            if s.len() > *len {
                return Err(CodecError::mismatch(
                    schema,
                    format!("field '{field}' is {} bytes, width is {len}", s.len()),
                ));
            }
            if s.contains(&0) {
                return Err(CodecError::mismatch(schema, format!("field '{field}' contains NUL")));
            }
            buf.put_slice(s);
            buf.put_bytes(0, len - s.len());
            Ok(())
        }
        FieldKind::FixedArray(elem, len) => {
            let items = value.as_array().ok_or_else(wrong)?;
            if items.len() != *len {
                return Err(CodecError::mismatch(
                    schema,
                    format!("field '{field}' has {} elements, expected {len}", items.len()),
                ));
            }
            items
                .iter()
                .try_for_each(|item| encode_field(buf, schema, field, elem, item))
        }
        FieldKind::Group(fields) => {
            let group = value.as_group().ok_or_else(wrong)?;
            if group.len() != fields.len() {
                return Err(CodecError::mismatch(
                    schema,
                    format!("group '{field}' has {} fields, expected {}", group.len(), fields.len()),
                ));
            }
            for f in fields {
                let v = group.get(f.name).ok_or_else(|| {
                    CodecError::mismatch(schema, format!("group '{field}' missing '{}'", f.name))
                })?;
                encode_field(buf, schema, f.name, &f.kind, v)?;
            }
            Ok(())
        }
        FieldKind::DynamicBytes | FieldKind::DynamicString => {
            buf.put_slice(trailing_bytes(schema, field, Some(value))?);
            Ok(())
        }
    }
}

/// Decode one fixed-size field. Callers have already checked the length.
fn decode_field(cur: &mut &[u8], kind: &FieldKind) -> Value {
    match kind {
        FieldKind::Int(width) => Value::Int(cur.get_uint_le(width.bytes())),
        FieldKind::FixedString(len) => {
            let raw = &cur[..*len];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(*len);
            let s = String::from_utf8_lossy(&raw[..end]).into_owned();
            cur.advance(*len);
            Value::Str(s)
        }
        FieldKind::FixedArray(elem, len) => {
            Value::Array((0..*len).map(|_| decode_field(cur, elem)).collect())
        }
        FieldKind::Group(fields) => {
            let mut group = Record::new();
            for f in fields {
                group.set(f.name, decode_field(cur, &f.kind));
            }
            Value::Group(group)
        }
        // Trailing kinds are handled by `decode`, which knows the declared size.
        FieldKind::DynamicBytes => Value::Bytes(Vec::new()),
        FieldKind::DynamicString => Value::Str(String::new()),
    }
}
