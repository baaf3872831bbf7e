//! Error taxonomy of the content serialization protocol.
//!
//! Framing-level failures (bad tag, truncated stream, invalid length) are
//! fatal to a decode and surface immediately. Payload-level failures are
//! contained: they are captured into the offending object's slot and only
//! resurface when that slot is dereferenced, which is why [`ReadError`] is
//! `Clone`.

use taskwire_buffers::BufferError;
use thiserror::Error;

/// Errors raised while encoding an object graph.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Corrupt internal state or misuse of the protocol.
    #[error("serialization protocol error: {0}")]
    Protocol(String),
    /// The object's type has no registered codec of any kind.
    #[error("no codec registered for the object type")]
    UnsupportedType,
    /// One particular object's payload failed to serialize. The emitted tag
    /// has been patched to its error sibling so readers stay in sync.
    #[error("failed to write object ({type_name})")]
    ObjectWrite {
        type_name: String,
        #[source]
        source: Box<WriteError>,
    },
    /// An element of an object array failed to serialize.
    #[error("failed to write array element at index {index}")]
    ArrayElement {
        index: usize,
        #[source]
        source: Box<WriteError>,
    },
    /// Failure reported by user codec code.
    #[error("{0}")]
    Message(String),
}

/// Errors raised while decoding a stream.
#[derive(Debug, Error, Clone)]
pub enum ReadError {
    /// The stream ended where a command or payload was expected.
    #[error("unexpected end of stream ({0})")]
    Eof(String),
    /// A command of a different family was found than the call expects.
    #[error("different type expected to be read from stream ({0})")]
    ObjectType(String),
    /// Corrupt stream framing: unrecognized command, invalid length, or an
    /// unresolvable back-reference index.
    #[error("serialization protocol error: {0}")]
    Protocol(String),
    /// Type resolution or instantiation failed.
    #[error("serialization reflection error: {0}")]
    Reflection(String),
    /// One particular object's payload failed to reconstruct.
    #[error("failed to read object ({type_name})")]
    ObjectRead {
        type_name: String,
        #[source]
        source: Box<ReadError>,
    },
    /// The writer recorded that it failed to emit this object; the slot
    /// replays this error on every dereference.
    #[error("writer failed to emit object ({0})")]
    ObjectWrite(String),
    /// Failure reported by user codec code.
    #[error("{0}")]
    Message(String),
}

impl From<BufferError> for ReadError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::EndOfBuffer => ReadError::Eof("end of stream".into()),
            BufferError::InvalidUtf8 => {
                ReadError::Protocol("invalid utf-8 string content".into())
            }
            BufferError::MalformedVarint => ReadError::Protocol("malformed varint".into()),
        }
    }
}

impl ReadError {
    pub(crate) fn wrap(type_name: impl Into<String>, source: ReadError) -> Self {
        ReadError::ObjectRead {
            type_name: type_name.into(),
            source: Box::new(source),
        }
    }
}

impl WriteError {
    pub(crate) fn wrap(type_name: impl Into<String>, source: WriteError) -> Self {
        WriteError::ObjectWrite {
            type_name: type_name.into(),
            source: Box::new(source),
        }
    }
}
