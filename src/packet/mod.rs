//! Wire format: schemas, values and the codec.

pub mod codec;
pub mod error;
pub mod schema;
pub mod value;

pub use codec::{decode, encode, frame_len, Decoded};
pub use error::CodecError;
pub use schema::{Direction, FieldKind, FieldSpec, IntWidth, PacketSchema, SchemaBuilder, SEQUENCE_WIDTH};
pub use value::{Record, Value};
