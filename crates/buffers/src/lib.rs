//! Byte buffer primitives shared by the taskwire serialization protocol.
//!
//! [`ByteWriter`] is a growable big-endian buffer that supports patching
//! previously written bytes in place, which the content codec relies on to
//! rewrite command tags and length fields after a failed nested write.
//! [`ByteReader`] is a bounds-checked cursor over a byte slice with an
//! adjustable end position, used to scope length-prefixed sub-regions.

mod reader;
mod writer;

pub use reader::ByteReader;
pub use writer::ByteWriter;

use thiserror::Error;

/// Errors raised by the buffer primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// A read went past the end of the readable region.
    #[error("end of buffer")]
    EndOfBuffer,
    /// A string read produced bytes that are not valid UTF-8.
    #[error("invalid utf-8 content")]
    InvalidUtf8,
    /// A varint ran over its maximum encoded width.
    #[error("malformed varint")]
    MalformedVarint,
}
