//! Type-space resolution.
//!
//! Every type reference on the wire is a resolver id plus a type name. The
//! resolver maps ids to type spaces (views over a codec registry); an empty
//! id denotes the default space. The resolver is shared by independent
//! encoder and decoder instances, possibly across threads, so
//! implementations must be safe for concurrent lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::registry::CodecRegistry;

/// A handle to one type space: a registry the resolver knows under some id.
#[derive(Clone)]
pub struct SpaceHandle(pub Arc<CodecRegistry>);

impl SpaceHandle {
    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.0
    }
}

impl std::fmt::Debug for SpaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceHandle").finish_non_exhaustive()
    }
}

/// Bidirectional mapping between resolver ids and type spaces.
pub trait SpaceResolver: Send + Sync {
    /// The id under which `space` is known, or `None` for the default space.
    fn identifier_for(&self, space: &SpaceHandle) -> Option<String>;

    /// The space registered under `id`; `None` or the empty id resolve to
    /// the default space. Returns `None` when the id is unknown.
    fn space_for(&self, id: Option<&str>) -> Option<SpaceHandle>;
}

/// Resolver over one default space plus any number of named spaces.
pub struct DefaultSpaceResolver {
    default: Arc<CodecRegistry>,
    named: HashMap<String, Arc<CodecRegistry>>,
}

impl DefaultSpaceResolver {
    pub fn new(default: Arc<CodecRegistry>) -> Self {
        Self {
            default,
            named: HashMap::new(),
        }
    }

    /// Registers a named space.
    pub fn register(&mut self, id: impl Into<String>, registry: Arc<CodecRegistry>) {
        self.named.insert(id.into(), registry);
    }
}

impl SpaceResolver for DefaultSpaceResolver {
    fn identifier_for(&self, space: &SpaceHandle) -> Option<String> {
        if Arc::ptr_eq(&space.0, &self.default) {
            return None;
        }
        self.named
            .iter()
            .find(|(_, r)| Arc::ptr_eq(r, &space.0))
            .map(|(id, _)| id.clone())
    }

    fn space_for(&self, id: Option<&str>) -> Option<SpaceHandle> {
        match id {
            None | Some("") => Some(SpaceHandle(self.default.clone())),
            Some(id) => self.named.get(id).cloned().map(SpaceHandle),
        }
    }
}
