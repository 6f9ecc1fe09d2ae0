//! Codec error taxonomy.

/// Errors produced while building schemas or encoding/decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Buffer is shorter than the schema's minimum size.
    #[error("Truncated frame: header={header:#04X}, need={need}, got={got}")]
    TruncatedFrame { header: u8, need: usize, got: usize },

    /// Declared dynamic size does not fit the buffer (or the frame limit).
    #[error("Invalid length: header={header:#04X}, declared={declared}, available={available}")]
    InvalidLength {
        header: u8,
        declared: usize,
        available: usize,
    },

    /// Value shape disagrees with the schema.
    #[error("Schema mismatch in {schema}: {reason}")]
    SchemaMismatch { schema: &'static str, reason: String },
}

impl CodecError {
    pub(crate) fn mismatch(schema: &'static str, reason: impl Into<String>) -> Self {
        CodecError::SchemaMismatch {
            schema,
            reason: reason.into(),
        }
    }
}
