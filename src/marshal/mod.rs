// ABOUTME: Type marshaling between backing-store payloads and native values
// ABOUTME: Dialect type tables plus the payload converter

pub mod convert;
pub mod dialect;

pub use convert::{decode_text, encode_text, ConversionError, Marshaler};
pub use dialect::{ColumnType, Dialect, TemporalFormat};
