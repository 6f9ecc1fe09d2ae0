//! Declarative wire layouts.
//!
//! A [`PacketSchema`] maps one logical packet type to bytes:
//! `header [+ sub_header] + fields... [+ trailing] [+ sequence]`, little-endian
//! and unpadded. Schemas are built once at startup through
//! [`SchemaBuilder::build`], which validates the layout and precomputes the
//! offsets the codec and the receive loop need.

use std::collections::HashSet;
use std::sync::Arc;

use super::error::CodecError;

/// Width of the per-direction sequence counter appended to sequenced frames.
pub const SEQUENCE_WIDTH: usize = 1;

/// Which way a schema travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    Incoming,
    /// Server to client.
    Outgoing,
    Both,
}

impl Direction {
    pub fn is_incoming(self) -> bool {
        matches!(self, Direction::Incoming | Direction::Both)
    }

    pub fn is_outgoing(self) -> bool {
        matches!(self, Direction::Outgoing | Direction::Both)
    }
}

/// Byte width of an integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    U8,
    U16,
    U32,
    U64,
}

impl IntWidth {
    pub fn bytes(self) -> usize {
        match self {
            IntWidth::U8 => 1,
            IntWidth::U16 => 2,
            IntWidth::U32 => 4,
            IntWidth::U64 => 8,
        }
    }

    /// Largest value representable at this width.
    pub fn max(self) -> u64 {
        match self {
            IntWidth::U8 => u8::MAX.into(),
            IntWidth::U16 => u16::MAX.into(),
            IntWidth::U32 => u32::MAX.into(),
            IntWidth::U64 => u64::MAX,
        }
    }
}

/// Layout of a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Int(IntWidth),
    /// Exactly `len` bytes, zero-padded on encode, cut at the first NUL on decode.
    FixedString(usize),
    /// `len` contiguous copies of the element layout.
    FixedArray(Box<FieldKind>, usize),
    /// Named group of fields, used as a composite array element.
    Group(Vec<FieldSpec>),
    /// Trailing raw bytes sized by a size field.
    DynamicBytes,
    /// Trailing string sized by a size field.
    DynamicString,
}

impl FieldKind {
    /// Encoded size, or `None` for the trailing dynamic kinds.
    pub fn static_size(&self) -> Option<usize> {
        match self {
            FieldKind::Int(w) => Some(w.bytes()),
            FieldKind::FixedString(len) => Some(*len),
            FieldKind::FixedArray(elem, len) => elem.static_size().map(|s| s * len),
            FieldKind::Group(fields) => fields.iter().map(|f| f.kind.static_size()).sum(),
            FieldKind::DynamicBytes | FieldKind::DynamicString => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, FieldKind::DynamicBytes | FieldKind::DynamicString)
    }
}

/// One named field of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// When set, this field is a size prefix holding the byte length of the
    /// named trailing field. Its value is computed on encode.
    pub size_of: Option<&'static str>,
}

impl FieldSpec {
    pub fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            size_of: None,
        }
    }

    pub fn u8(name: &'static str) -> Self {
        Self::new(name, FieldKind::Int(IntWidth::U8))
    }

    pub fn u16(name: &'static str) -> Self {
        Self::new(name, FieldKind::Int(IntWidth::U16))
    }

    pub fn u32(name: &'static str) -> Self {
        Self::new(name, FieldKind::Int(IntWidth::U32))
    }

    pub fn u64(name: &'static str) -> Self {
        Self::new(name, FieldKind::Int(IntWidth::U64))
    }

    pub fn string(name: &'static str, len: usize) -> Self {
        Self::new(name, FieldKind::FixedString(len))
    }

    pub fn array(name: &'static str, elem: FieldKind, len: usize) -> Self {
        Self::new(name, FieldKind::FixedArray(Box::new(elem), len))
    }

    pub fn group(name: &'static str, fields: Vec<FieldSpec>) -> Self {
        Self::new(name, FieldKind::Group(fields))
    }

    pub fn bytes(name: &'static str) -> Self {
        Self::new(name, FieldKind::DynamicBytes)
    }

    pub fn text(name: &'static str) -> Self {
        Self::new(name, FieldKind::DynamicString)
    }

    /// Size prefix for the trailing field `target`.
    pub fn size(name: &'static str, width: IntWidth, target: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Int(width),
            size_of: Some(target),
        }
    }

    pub fn is_size_prefix(&self) -> bool {
        self.size_of.is_some()
    }
}

/// Precomputed location of the size prefix inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeField {
    /// Byte offset from the start of the frame (header included).
    pub offset: usize,
    pub width: IntWidth,
}

/// Immutable description of one packet type.
#[derive(Debug, PartialEq, Eq)]
pub struct PacketSchema {
    name: &'static str,
    header: u8,
    sub_header: Option<u8>,
    direction: Direction,
    has_sequence: bool,
    fields: Vec<FieldSpec>,
    prefix_len: usize,
    size_field: Option<SizeField>,
}

impl PacketSchema {
    pub fn builder(name: &'static str, header: u8) -> SchemaBuilder {
        SchemaBuilder {
            name,
            header,
            sub_header: None,
            direction: Direction::Both,
            has_sequence: false,
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn header(&self) -> u8 {
        self.header
    }

    pub fn sub_header(&self) -> Option<u8> {
        self.sub_header
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn has_sequence(&self) -> bool {
        self.has_sequence
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn size_field(&self) -> Option<SizeField> {
        self.size_field
    }

    /// Bytes before the trailing region: header, sub-header and fixed fields.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Smallest valid frame (trailing region empty).
    pub fn min_size(&self) -> usize {
        self.prefix_len + self.sequence_len()
    }

    /// Total frame size when the schema has no trailing region.
    pub fn static_size(&self) -> Option<usize> {
        match self.size_field {
            Some(_) => None,
            None => Some(self.min_size()),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.size_field.is_some()
    }

    pub(crate) fn sequence_len(&self) -> usize {
        if self.has_sequence {
            SEQUENCE_WIDTH
        } else {
            0
        }
    }

    /// Length of the header plus optional sub-header.
    pub(crate) fn header_len(&self) -> usize {
        1 + usize::from(self.sub_header.is_some())
    }
}

/// Builder for [`PacketSchema`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: &'static str,
    header: u8,
    sub_header: Option<u8>,
    direction: Direction,
    has_sequence: bool,
    fields: Vec<FieldSpec>,
}

impl SchemaBuilder {
    pub fn sub_header(mut self, sub: u8) -> Self {
        self.sub_header = Some(sub);
        self
    }

    pub fn incoming(mut self) -> Self {
        self.direction = Direction::Incoming;
        self
    }

    pub fn outgoing(mut self) -> Self {
        self.direction = Direction::Outgoing;
        self
    }

    pub fn both(mut self) -> Self {
        self.direction = Direction::Both;
        self
    }

    pub fn sequenced(mut self) -> Self {
        self.has_sequence = true;
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Validate the layout and freeze it.
    pub fn build(self) -> Result<Arc<PacketSchema>, CodecError> {
        let name = self.name;
        let fail = |reason: String| CodecError::mismatch(name, reason);

        let mut seen = HashSet::new();
        for f in &self.fields {
            if !seen.insert(f.name) {
                return Err(fail(format!("duplicate field '{}'", f.name)));
            }
            validate_nested(name, &f.kind, true)?;
        }

        let dynamic: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind.is_dynamic())
            .map(|(i, _)| i)
            .collect();
        if dynamic.len() > 1 {
            return Err(fail("more than one trailing field".into()));
        }
        if let Some(&idx) = dynamic.first() {
            if idx + 1 != self.fields.len() {
                return Err(fail(format!(
                    "trailing field '{}' must be last",
                    self.fields[idx].name
                )));
            }
        }

        let sizes: Vec<&FieldSpec> = self.fields.iter().filter(|f| f.is_size_prefix()).collect();
        match (sizes.as_slice(), dynamic.first()) {
            ([], None) => {}
            ([size], Some(&idx)) => {
                let trailing = &self.fields[idx];
                if size.size_of != Some(trailing.name) {
                    return Err(fail(format!(
                        "size field '{}' must describe trailing field '{}'",
                        size.name, trailing.name
                    )));
                }
            }
            ([], Some(&idx)) => {
                return Err(fail(format!(
                    "trailing field '{}' has no size field",
                    self.fields[idx].name
                )));
            }
            ([size], None) => {
                return Err(fail(format!(
                    "size field '{}' has no trailing field",
                    size.name
                )));
            }
            _ => return Err(fail("more than one size field".into())),
        }

        let mut offset = 1 + usize::from(self.sub_header.is_some());
        let mut size_field = None;
        for f in self.fields.iter().filter(|f| !f.kind.is_dynamic()) {
            if f.is_size_prefix() {
                let FieldKind::Int(width) = f.kind else {
                    return Err(fail(format!("size field '{}' must be an integer", f.name)));
                };
                size_field = Some(SizeField { offset, width });
            }
            offset += f
                .kind
                .static_size()
                .ok_or_else(|| fail(format!("field '{}' has no static size", f.name)))?;
        }

        Ok(Arc::new(PacketSchema {
            name,
            header: self.header,
            sub_header: self.sub_header,
            direction: self.direction,
            has_sequence: self.has_sequence,
            fields: self.fields,
            prefix_len: offset,
            size_field,
        }))
    }
}

/// Dynamic kinds and size prefixes are only legal at the top level.
fn validate_nested(schema: &'static str, kind: &FieldKind, top: bool) -> Result<(), CodecError> {
    match kind {
        FieldKind::Int(_) => Ok(()),
        FieldKind::FixedString(0) => Err(CodecError::mismatch(schema, "zero-width string")),
        FieldKind::FixedString(_) => Ok(()),
        FieldKind::DynamicBytes | FieldKind::DynamicString if top => Ok(()),
        FieldKind::DynamicBytes | FieldKind::DynamicString => Err(CodecError::mismatch(
            schema,
            "trailing data inside an array or group",
        )),
        FieldKind::FixedArray(elem, _) => validate_nested(schema, elem, false),
        FieldKind::Group(fields) => {
            if fields.is_empty() {
                return Err(CodecError::mismatch(schema, "empty group"));
            }
            let mut seen = HashSet::new();
            for f in fields {
                if !seen.insert(f.name) {
                    return Err(CodecError::mismatch(
                        schema,
                        format!("duplicate group field '{}'", f.name),
                    ));
                }
                if f.is_size_prefix() {
                    return Err(CodecError::mismatch(
                        schema,
                        format!("size field '{}' inside a group", f.name),
                    ));
                }
                validate_nested(schema, &f.kind, false)?;
            }
            Ok(())
        }
    }
}
