//! Binary object-content serialization for persisted build state.
//!
//! A [`ContentWriter`] serializes a live object graph into a growable byte
//! buffer; a [`ContentReader`] consumes the produced stream and reconstructs
//! the graph. The protocol is positional — the two sides must agree on call
//! order and arity out of band — and self-describing only at the level of
//! individual fields, each prefixed by a single command byte (see [`cmd`]).
//!
//! The codec dedups objects by reference identity and registered boxed
//! values by equality, interns strings with lexicographic prefix
//! compression, and picks the narrowest adaptive encoding for ints and
//! longs. Complex objects are framed with a byte length, so one object's
//! failure — on either side — never desynchronizes the rest of the stream:
//! the writer patches the command to its `_ERROR` sibling, and the reader
//! records the failure in that object's slot and keeps decoding.
//!
//! Per-type behavior comes from a [`CodecRegistry`] shared read-only by both
//! sides, and type references resolve through a [`SpaceResolver`].
//!
//! ```
//! use std::sync::Arc;
//! use taskwire_serial::{obj, CodecRegistry, ContentReader, ContentWriter};
//!
//! let registry = Arc::new(CodecRegistry::with_defaults());
//! let mut writer = ContentWriter::new(registry.clone());
//! writer.write_int(42);
//! writer.write_utf("build/task/output").unwrap();
//! let bytes = writer.drain_to_bytes();
//!
//! let mut reader = ContentReader::new(registry, &bytes);
//! assert_eq!(reader.read_int().unwrap(), 42);
//! assert_eq!(&**reader.read_utf().unwrap(), "build/task/output");
//! ```

pub mod cmd;
mod error;
mod object;
mod reader;
mod registry;
mod resolver;
mod slot;
mod writer;

pub use error::{ReadError, WriteError};
pub use object::{obj, Obj, ProxyObject, TypeHandle};
pub use reader::ContentReader;
pub use registry::{CodecRegistry, Externalizable, TypeCodec, ValueKey};
pub use resolver::{DefaultSpaceResolver, SpaceHandle, SpaceResolver};
pub use writer::ContentWriter;
