//! The object-graph currency of the codec.
//!
//! A serialized graph node is an [`Obj`]: a reference-counted, type-erased
//! value. Reference identity (`Rc` pointer identity) is what the write-side
//! object table dedups on, and what index back-references reproduce on the
//! read side.

use std::any::Any;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::registry::TypeCodec;
use crate::resolver::SpaceHandle;

/// A node of a serializable object graph.
pub type Obj = Rc<dyn Any>;

/// Wraps a value into an [`Obj`].
pub fn obj<T: Any>(value: T) -> Obj {
    Rc::new(value)
}

/// Identity key of an object: the address of its heap allocation. The write
/// side pins every registered object for the session, so a key can never be
/// recycled while it is in the table.
pub(crate) fn obj_identity(o: &Obj) -> usize {
    Rc::as_ptr(o) as *const () as usize
}

pub(crate) fn type_identity(codec: &Arc<TypeCodec>) -> usize {
    Arc::as_ptr(codec) as *const () as usize
}

/// A type literal: the runtime value a type reference decodes to.
///
/// Two handles to the same registered codec are identity-equal on the wire,
/// regardless of how many `TypeHandle` wrappers exist around the `Arc`.
#[derive(Clone)]
pub struct TypeHandle(pub Arc<TypeCodec>);

impl TypeHandle {
    /// Registered name of the type.
    pub fn name(&self) -> &str {
        &self.0.name
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeHandle").field(&self.0.name).finish()
    }
}

/// A dynamic-proxy object: a type space, the interface list the proxy
/// exposes, and the handler object invocations are delegated to.
///
/// The codec serializes and reconstructs the triple; invoking through the
/// proxy is the caller's business. On the read side the interfaces are read
/// leniently: resolution failures are collected so the handler is still
/// attempted, and the slot fails with the aggregate only afterwards.
pub struct ProxyObject {
    pub space: Option<SpaceHandle>,
    pub interfaces: Vec<TypeHandle>,
    pub handler: Obj,
}
