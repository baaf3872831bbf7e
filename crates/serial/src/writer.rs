//! `ContentWriter` — serializes a live object graph into a growable byte
//! buffer.
//!
//! The writer dedups objects by reference identity, interns registered boxed
//! values and strings by equality, picks the narrowest adaptive encoding for
//! ints and longs, and prefix-compresses strings against their lexicographic
//! neighbors. Every length-prefixed nested write is atomically recoverable:
//! if the payload fails partway through, the already-emitted command byte is
//! patched to its `_ERROR` sibling and the length field still covers the
//! bytes actually written, so a reader can skip the region and keep going.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::ops::Bound;
use std::sync::Arc;

use taskwire_buffers::ByteWriter;

use crate::cmd;
use crate::error::WriteError;
use crate::object::{obj_identity, type_identity, Obj, ProxyObject, TypeHandle};
use crate::registry::{ArrayKind, CodecKind, CodecRegistry, TypeCodec, ValueCodec, ValueKey};
use crate::resolver::{DefaultSpaceResolver, SpaceHandle, SpaceResolver};

/// Minimum qualifying common prefix (in chars) for string prefix
/// compression.
const UTF_PREFIX_MIN_LEN: usize = 8;

/// The encoder of the content serialization protocol.
///
/// Single-threaded and non-reentrant; use one instance per graph being
/// serialized. Dedup state persists across [`ContentWriter::drain_to`] calls
/// so a session of related records shares one intern space; only
/// [`ContentWriter::reset`] drops it.
pub struct ContentWriter {
    out: ByteWriter,
    registry: Arc<CodecRegistry>,
    resolver: Arc<dyn SpaceResolver>,
    /// Identity-keyed object table: heap address of the pointee to index.
    object_indices: HashMap<usize, u32>,
    /// Keeps table occupants alive so identity keys cannot be recycled.
    pinned: Vec<Obj>,
    pinned_types: Vec<Arc<TypeCodec>>,
    /// Equality-keyed intern table of previously written strings.
    string_interns: BTreeMap<String, u32>,
    /// Equality-keyed intern tables for registered boxed value types.
    value_interns: HashMap<TypeId, HashMap<ValueKey, u32>>,
    /// Equality intern tables for externalizable value types.
    extern_interns: HashMap<TypeId, Box<dyn Any>>,
    warned_types: HashSet<TypeId>,
}

impl ContentWriter {
    /// Creates a writer over `registry` with a default single-space
    /// resolver.
    pub fn new(registry: Arc<CodecRegistry>) -> Self {
        let resolver = Arc::new(DefaultSpaceResolver::new(registry.clone()));
        Self::with_resolver(registry, resolver)
    }

    pub fn with_resolver(registry: Arc<CodecRegistry>, resolver: Arc<dyn SpaceResolver>) -> Self {
        Self {
            out: ByteWriter::new(),
            registry,
            resolver,
            object_indices: HashMap::new(),
            pinned: Vec::new(),
            pinned_types: Vec::new(),
            string_interns: BTreeMap::new(),
            value_interns: HashMap::new(),
            extern_interns: HashMap::new(),
            warned_types: HashSet::new(),
        }
    }

    /// Raw access to the output buffer, for value codec payloads.
    pub fn raw_out(&mut self) -> &mut ByteWriter {
        &mut self.out
    }

    /// Writes an untagged varint-length-prefixed UTF-8 string, bypassing the
    /// intern table. Used for enum variant names and value payloads.
    pub fn write_raw_utf(&mut self, s: &str) {
        self.out.var_u32(s.len() as u32);
        self.out.buf(s.as_bytes());
    }

    pub fn write_null(&mut self) {
        self.out.u8(cmd::OBJECT_NULL);
    }

    pub fn write_boolean(&mut self, v: bool) {
        self.out
            .u8(if v { cmd::BOOLEAN_TRUE } else { cmd::BOOLEAN_FALSE });
    }

    pub fn write_byte(&mut self, v: u8) {
        self.out.u8(cmd::BYTE);
        self.out.u8(v);
    }

    /// Writes a bulk byte run: one command for the whole slice. Writing an
    /// empty slice emits nothing.
    pub fn write_bytes(&mut self, b: &[u8]) {
        if b.is_empty() {
            return;
        }
        self.out.u8(cmd::BYTEARRAY);
        self.write_int(b.len() as i32);
        self.out.buf(b);
    }

    pub fn write_short(&mut self, v: i16) {
        if v as u16 & 0xFF00 == 0 {
            self.out.u8(cmd::SHORT_1);
            self.out.u8(v as u8);
        } else {
            self.out.u8(cmd::SHORT_2);
            self.out.i16(v);
        }
    }

    pub fn write_char(&mut self, c: char) {
        self.out.u8(cmd::CHAR);
        self.out.u32(c as u32);
    }

    /// Writes a bulk char run: one command, then each char as a 4-byte
    /// scalar.
    pub fn write_chars(&mut self, s: &str) {
        self.out.u8(cmd::CHARS);
        self.write_int(s.chars().count() as i32);
        for c in s.chars() {
            self.out.u32(c as u32);
        }
    }

    /// Writes an int with the narrowest command that round-trips the exact
    /// value, including its sign.
    pub fn write_int(&mut self, v: i32) {
        let out = &mut self.out;
        let u = v as u32;
        match u & 0xFFFF_0000 {
            0x0000_0000 => {
                if u & 0xFF00 == 0 {
                    match v {
                        0 => out.u8(cmd::INT_ZERO),
                        1 => out.u8(cmd::INT_ONE),
                        _ => {
                            out.u8(cmd::INT_1);
                            out.u8(u as u8);
                        }
                    }
                } else {
                    out.u8(cmd::INT_2);
                    out.u16(u as u16);
                }
            }
            0xFFFF_0000 => {
                if u & 0xFF00 == 0xFF00 {
                    if v == -1 {
                        out.u8(cmd::INT_NEGATIVE_ONE);
                    } else {
                        out.u8(cmd::INT_F_1);
                        out.u8(u as u8);
                    }
                } else {
                    out.u8(cmd::INT_F_2);
                    out.u16(u as u16);
                }
            }
            _ => match u & 0xFF00_0000 {
                0xFF00_0000 => {
                    out.u8(cmd::INT_F_3);
                    out.u8((u >> 16) as u8);
                    out.u16(u as u16);
                }
                0x0000_0000 => {
                    out.u8(cmd::INT_3);
                    out.u8((u >> 16) as u8);
                    out.u16(u as u16);
                }
                _ => {
                    out.u8(cmd::INT_4);
                    out.u32(u);
                }
            },
        }
    }

    /// Writes a long with the narrowest command that round-trips the exact
    /// value, including its sign.
    pub fn write_long(&mut self, v: i64) {
        let out = &mut self.out;
        let u = v as u64;
        let top4 = u & 0xFFFF_FFFF_0000_0000;
        if top4 == 0 {
            if u & 0xFFFF_0000 == 0 {
                if v == 0 {
                    out.u8(cmd::LONG_ZERO);
                } else {
                    out.u8(cmd::LONG_2);
                    out.u16(u as u16);
                }
            } else {
                out.u8(cmd::LONG_4);
                out.u32(u as u32);
            }
        } else if top4 == 0xFFFF_FFFF_0000_0000 {
            if u & 0xFFFF_0000 == 0xFFFF_0000 {
                if v == -1 {
                    out.u8(cmd::LONG_NEGATIVE_ONE);
                } else {
                    out.u8(cmd::LONG_F_2);
                    out.u16(u as u16);
                }
            } else {
                out.u8(cmd::LONG_F_4);
                out.u32(u as u32);
            }
        } else {
            let top2 = u & 0xFFFF_0000_0000_0000;
            if top2 == 0xFFFF_0000_0000_0000 {
                out.u8(cmd::LONG_F_6);
                out.u16((u >> 32) as u16);
                out.u32(u as u32);
            } else if top2 == 0 {
                out.u8(cmd::LONG_6);
                out.u16((u >> 32) as u16);
                out.u32(u as u32);
            } else {
                out.u8(cmd::LONG_8);
                out.u64(u);
            }
        }
    }

    pub fn write_float(&mut self, v: f32) {
        self.out.u8(cmd::FLOAT);
        self.out.f32(v);
    }

    pub fn write_double(&mut self, v: f64) {
        self.out.u8(cmd::DOUBLE);
        self.out.f64(v);
    }

    /// Writes a string through the intern table: an index reference when the
    /// content was already written, otherwise full or prefix-compressed
    /// content.
    pub fn write_utf(&mut self, s: &str) -> Result<(), WriteError> {
        self.write_utf_impl(s, false)
    }

    fn write_utf_impl(&mut self, s: &str, objwrite: bool) -> Result<(), WriteError> {
        let idx_base = if objwrite {
            cmd::OBJECT_UTF_IDX_BASE
        } else {
            cmd::UTF_IDX_BASE
        };
        let floor = self
            .string_interns
            .range::<str, _>((Bound::Unbounded, Bound::Included(s)))
            .next_back();
        if let Some((k, &idx)) = floor {
            if k == s {
                write_index_command(&mut self.out, idx, idx_base);
                return Ok(());
            }
        }
        let slen = s.chars().count();
        let mut prefix: Option<(u32, usize)> = None;
        if slen > UTF_PREFIX_MIN_LEN {
            let floor_info = floor.map(|(k, &i)| (i, common_prefix_chars(s, k)));
            let higher_info = self
                .string_interns
                .range::<str, _>((Bound::Excluded(s), Bound::Unbounded))
                .next()
                .map(|(k, &i)| (i, common_prefix_chars(s, k)));
            // the floor neighbor wins ties; the higher one only when it
            // shares strictly more characters
            prefix = match (floor_info, higher_info) {
                (Some((fi, fc)), Some((_, hc))) if hc <= fc => Some((fi, fc)),
                (Some(_), Some(h)) => Some(h),
                (a, b) => a.or(b),
            }
            .filter(|&(_, common)| common >= UTF_PREFIX_MIN_LEN);
        }
        let new_idx = self.string_interns.len() as u32;
        if self.string_interns.insert(s.to_owned(), new_idx).is_some() {
            return Err(WriteError::Protocol(format!(
                "string is already present in the intern table: {s}"
            )));
        }
        match prefix {
            Some((prefix_idx, common)) => self.write_prefixed_utf(s, prefix_idx, common, objwrite),
            None => self.write_utf_data(s, objwrite),
        }
        Ok(())
    }

    fn write_utf_data(&mut self, s: &str, objwrite: bool) {
        let out = &mut self.out;
        if is_low_bytes(s.chars()) {
            out.u8(if objwrite {
                cmd::OBJECT_UTF_LOWBYTES
            } else {
                cmd::UTF_LOWBYTES
            });
            out.var_u32(s.chars().count() as u32);
            for c in s.chars() {
                out.u8(c as u8);
            }
        } else {
            out.u8(if objwrite { cmd::OBJECT_UTF } else { cmd::UTF });
            out.var_u32(s.len() as u32);
            out.buf(s.as_bytes());
        }
    }

    fn write_prefixed_utf(&mut self, s: &str, prefix_idx: u32, common: usize, objwrite: bool) {
        let byte_off = s
            .char_indices()
            .nth(common)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let suffix = &s[byte_off..];
        let out = &mut self.out;
        if is_low_bytes(suffix.chars()) {
            out.u8(if objwrite {
                cmd::OBJECT_UTF_PREFIXED_LOWBYTES
            } else {
                cmd::UTF_PREFIXED_LOWBYTES
            });
            out.var_u32(prefix_idx);
            out.var_u32(common as u32);
            out.var_u32(suffix.chars().count() as u32);
            for c in suffix.chars() {
                out.u8(c as u8);
            }
        } else {
            out.u8(if objwrite {
                cmd::OBJECT_UTF_PREFIXED
            } else {
                cmd::UTF_PREFIXED
            });
            out.var_u32(prefix_idx);
            out.var_u32(common as u32);
            out.var_u32(suffix.len() as u32);
            out.buf(suffix.as_bytes());
        }
    }

    /// Writes an object graph node; `None` is the null object.
    pub fn write_object(&mut self, value: Option<&Obj>) -> Result<(), WriteError> {
        let o = match value {
            None => {
                self.out.u8(cmd::OBJECT_NULL);
                return Ok(());
            }
            Some(o) => o,
        };
        if let Some(s) = o.downcast_ref::<String>() {
            return self.write_utf_impl(s, true);
        }
        if let Some(&idx) = self.object_indices.get(&obj_identity(o)) {
            write_index_command(&mut self.out, idx, cmd::OBJECT_IDX_BASE);
            return Ok(());
        }
        let tid = o.as_ref().type_id();
        if let Some(vc) = self.registry.value_by_id(tid) {
            return self.write_value_object(o, &vc, tid);
        }
        if let Some(kind) = array_kind_of(o.as_ref()) {
            return self.write_array(o, kind);
        }
        if let Some(handle) = o.downcast_ref::<TypeHandle>() {
            let codec = handle.0.clone();
            return self.write_type_or_index(&codec);
        }
        if let Some(tc) = self.registry.type_by_id(tid) {
            return match &tc.kind {
                CodecKind::Enum { .. } => self.write_enum(o, &tc),
                CodecKind::External(_) => self.write_external(o, &tc, tid),
                CodecKind::Custom { .. } => self.write_custom(o, &tc),
                CodecKind::Native { .. } => self.write_native(o, &tc, tid),
                CodecKind::Array(kind) => self.write_array(o, *kind),
            };
        }
        if let Some(space) = o.downcast_ref::<SpaceHandle>() {
            self.out.u8(cmd::OBJECT_CLASSLOADER);
            let id = self.resolver.identifier_for(space).unwrap_or_default();
            return self.write_utf(&id);
        }
        if o.downcast_ref::<ProxyObject>().is_some() {
            return self.write_proxy(o);
        }
        Err(WriteError::UnsupportedType)
    }

    /// Drains the accumulated bytes to `out`. Dedup tables are kept.
    pub fn drain_to<W: io::Write>(&mut self, out: &mut W) -> io::Result<()> {
        self.out.drain_to(out)
    }

    /// Takes the accumulated bytes. Dedup tables are kept.
    pub fn drain_to_bytes(&mut self) -> Vec<u8> {
        self.out.take()
    }

    /// Clears the buffer and drops all dedup history, permitting reuse for
    /// an unrelated record stream.
    pub fn reset(&mut self) {
        self.out.clear();
        self.object_indices.clear();
        self.pinned.clear();
        self.pinned_types.clear();
        self.string_interns.clear();
        self.value_interns.clear();
        self.extern_interns.clear();
        self.warned_types.clear();
    }

    fn insert_index(&mut self, key: usize) -> Result<u32, WriteError> {
        let idx = self.object_indices.len() as u32;
        if self.object_indices.insert(key, idx).is_some() {
            return Err(WriteError::Protocol(
                "object is already present in the object table".into(),
            ));
        }
        Ok(idx)
    }

    fn add_object(&mut self, o: &Obj) -> Result<u32, WriteError> {
        let idx = self.insert_index(obj_identity(o))?;
        self.pinned.push(o.clone());
        Ok(idx)
    }

    fn write_type_or_index(&mut self, codec: &Arc<TypeCodec>) -> Result<(), WriteError> {
        let key = type_identity(codec);
        if let Some(&idx) = self.object_indices.get(&key) {
            write_index_command(&mut self.out, idx, cmd::OBJECT_IDX_BASE);
            return Ok(());
        }
        self.out.u8(cmd::OBJECT_TYPE);
        self.write_external_class(codec)?;
        self.insert_index(key)?;
        self.pinned_types.push(codec.clone());
        Ok(())
    }

    fn write_external_class(&mut self, codec: &Arc<TypeCodec>) -> Result<(), WriteError> {
        let space = SpaceHandle(self.registry.clone());
        let id = self.resolver.identifier_for(&space).unwrap_or_default();
        self.write_utf(&id)?;
        self.write_utf(&codec.name)
    }

    fn write_value_object(
        &mut self,
        o: &Obj,
        vc: &Arc<ValueCodec>,
        tid: TypeId,
    ) -> Result<(), WriteError> {
        let key = (vc.key)(o.as_ref()).ok_or_else(|| {
            WriteError::Protocol(format!("value codec key mismatch: {}", vc.name))
        })?;
        if let Some(&idx) = self.value_interns.get(&tid).and_then(|m| m.get(&key)) {
            write_index_command(&mut self.out, idx, cmd::OBJECT_IDX_BASE);
            return Ok(());
        }
        self.out.u8(cmd::OBJECT_VALUE);
        self.write_utf(&vc.name)?;
        let idx = self.add_object(o)?;
        self.value_interns.entry(tid).or_default().insert(key, idx);
        (vc.write)(o.as_ref(), self)
    }

    fn write_array(&mut self, o: &Obj, kind: ArrayKind) -> Result<(), WriteError> {
        let codec = self
            .registry
            .array_codec(kind)
            .ok_or_else(|| WriteError::Protocol("array type is not registered".into()))?;
        let start = self.out.len();
        self.out.u8(cmd::OBJECT_ARRAY);
        self.write_type_or_index(&codec)?;
        self.add_object(o)?;
        let len_pos = self.out.len();
        match kind {
            ArrayKind::U8 => {
                let v = downcast::<Vec<u8>>(o, &codec.name)?;
                self.out.u32(v.len() as u32);
                self.out.buf(v);
            }
            ArrayKind::I16 => {
                let v = downcast::<Vec<i16>>(o, &codec.name)?;
                self.out.u32(v.len() as u32);
                for &x in v {
                    self.out.i16(x);
                }
            }
            ArrayKind::I32 => {
                let v = downcast::<Vec<i32>>(o, &codec.name)?;
                self.out.u32(v.len() as u32);
                for &x in v {
                    self.out.i32(x);
                }
            }
            ArrayKind::I64 => {
                let v = downcast::<Vec<i64>>(o, &codec.name)?;
                self.out.u32(v.len() as u32);
                for &x in v {
                    self.out.i64(x);
                }
            }
            ArrayKind::F32 => {
                let v = downcast::<Vec<f32>>(o, &codec.name)?;
                self.out.u32(v.len() as u32);
                for &x in v {
                    self.out.f32(x);
                }
            }
            ArrayKind::F64 => {
                let v = downcast::<Vec<f64>>(o, &codec.name)?;
                self.out.u32(v.len() as u32);
                for &x in v {
                    self.out.f64(x);
                }
            }
            ArrayKind::Bool => {
                let v = downcast::<Vec<bool>>(o, &codec.name)?;
                self.out.u32(v.len() as u32);
                for &x in v {
                    self.out.u8(x as u8);
                }
            }
            ArrayKind::Char => {
                let v = downcast::<Vec<char>>(o, &codec.name)?;
                self.out.u32(v.len() as u32);
                for &x in v {
                    self.out.u32(x as u32);
                }
            }
            ArrayKind::Obj => {
                let cell = downcast::<RefCell<Vec<Option<Obj>>>>(o, &codec.name)?;
                let v = cell.borrow();
                self.out.u32(v.len() as u32);
                for (i, el) in v.iter().enumerate() {
                    if let Err(e) = self.write_object(el.as_ref()) {
                        self.out.set_u8(start, cmd::OBJECT_ARRAY_ERROR);
                        // patch the length to the element count actually
                        // emitted so the reader pre-reads exactly those
                        self.out.set_u32(len_pos, i as u32);
                        return Err(WriteError::wrap(
                            codec.name.clone(),
                            WriteError::ArrayElement {
                                index: i,
                                source: Box::new(e),
                            },
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn write_enum(&mut self, o: &Obj, tc: &Arc<TypeCodec>) -> Result<(), WriteError> {
        let CodecKind::Enum { variant, .. } = &tc.kind else {
            return Err(WriteError::Protocol(format!(
                "enum codec expected for type: {}",
                tc.name
            )));
        };
        self.out.u8(cmd::OBJECT_ENUM);
        self.write_type_or_index(tc)?;
        let name = variant(o.as_ref()).ok_or_else(|| {
            WriteError::Protocol(format!("enum codec type mismatch: {}", tc.name))
        })?;
        self.write_raw_utf(name);
        self.add_object(o)?;
        Ok(())
    }

    fn write_external(
        &mut self,
        o: &Obj,
        tc: &Arc<TypeCodec>,
        tid: TypeId,
    ) -> Result<(), WriteError> {
        let CodecKind::External(vt) = &tc.kind else {
            return Err(WriteError::Protocol(format!(
                "externalizable codec expected for type: {}",
                tc.name
            )));
        };
        if let Some(intern) = &vt.intern {
            let hit = self
                .extern_interns
                .get(&tid)
                .and_then(|t| (intern.get)(t.as_ref(), o.as_ref()));
            if let Some(idx) = hit {
                write_index_command(&mut self.out, idx, cmd::OBJECT_IDX_BASE);
                return Ok(());
            }
        }
        let start = self.out.len();
        self.out.u8(cmd::OBJECT_EXTERNALIZABLE_4);
        self.write_type_or_index(tc)?;
        let obj_idx = self.add_object(o)?;
        let size_pos = self.out.len();
        self.out.u32(0);
        let body_start = self.out.len();
        if let Err(e) = (vt.write)(o.as_ref(), self) {
            self.out.set_u8(start, cmd::OBJECT_EXTERNALIZABLE_ERROR);
            let written = (self.out.len() - body_start) as u32;
            self.out.set_u32(size_pos, written);
            return Err(WriteError::wrap(tc.name.clone(), e));
        }
        let written = self.out.len() - body_start;
        if written <= 0xFF {
            // use a single length byte; small externalizable records are
            // common enough that the three spare bytes add up
            self.out.set_u8(size_pos, written as u8);
            self.out.set_u8(start, cmd::OBJECT_EXTERNALIZABLE_1);
            self.out.shift_down(body_start, size_pos + 1, written);
            self.out.truncate(self.out.len() - 3);
        } else {
            self.out.set_u32(size_pos, written as u32);
        }
        if let Some(intern) = &vt.intern {
            match self.extern_interns.get_mut(&tid) {
                Some(t) => (intern.insert)(t.as_mut(), o.as_ref(), obj_idx),
                None => {
                    let mut t = (intern.new_table)();
                    (intern.insert)(t.as_mut(), o.as_ref(), obj_idx);
                    self.extern_interns.insert(tid, t);
                }
            }
        }
        Ok(())
    }

    fn write_custom(&mut self, o: &Obj, tc: &Arc<TypeCodec>) -> Result<(), WriteError> {
        let CodecKind::Custom { write, .. } = &tc.kind else {
            return Err(WriteError::Protocol(format!(
                "custom codec expected for type: {}",
                tc.name
            )));
        };
        let start = self.out.len();
        self.out.u8(cmd::OBJECT_CUSTOM_SERIALIZABLE);
        self.write_type_or_index(tc)?;
        self.add_object(o)?;
        let size_pos = self.out.len();
        self.out.u32(0);
        let body_start = self.out.len();
        let res = write(o.as_ref(), self);
        let written = (self.out.len() - body_start) as u32;
        self.out.set_u32(size_pos, written);
        match res {
            Ok(()) => Ok(()),
            Err(e) => {
                self.out.set_u8(start, cmd::OBJECT_CUSTOM_SERIALIZABLE_ERROR);
                Err(WriteError::wrap(tc.name.clone(), e))
            }
        }
    }

    fn write_native(
        &mut self,
        o: &Obj,
        tc: &Arc<TypeCodec>,
        tid: TypeId,
    ) -> Result<(), WriteError> {
        let CodecKind::Native { write, .. } = &tc.kind else {
            return Err(WriteError::Protocol(format!(
                "native codec expected for type: {}",
                tc.name
            )));
        };
        if self.warned_types.insert(tid) {
            tracing::warn!(
                type_name = %tc.name,
                "object type is not content-serializable, falling back to native serialization"
            );
        }
        self.add_object(o)?;
        let start = self.out.len();
        self.out.u8(cmd::OBJECT_SERIALIZABLE);
        let size_pos = self.out.len();
        self.out.u32(0);
        let body_start = self.out.len();
        self.write_raw_utf(&tc.name);
        let mut payload = Vec::new();
        let res = write(o.as_ref(), &mut payload);
        if res.is_ok() {
            self.out.buf(&payload);
        }
        let written = (self.out.len() - body_start) as u32;
        self.out.set_u32(size_pos, written);
        match res {
            Ok(()) => Ok(()),
            Err(e) => {
                self.out.set_u8(start, cmd::OBJECT_SERIALIZABLE_ERROR);
                Err(WriteError::wrap(tc.name.clone(), e))
            }
        }
    }

    fn write_proxy(&mut self, o: &Obj) -> Result<(), WriteError> {
        let p = o
            .downcast_ref::<ProxyObject>()
            .ok_or_else(|| WriteError::Protocol("proxy object expected".into()))?;
        self.add_object(o)?;
        self.out.u8(cmd::OBJECT_PROXY);
        let id = p
            .space
            .as_ref()
            .and_then(|s| self.resolver.identifier_for(s))
            .unwrap_or_default();
        self.write_utf(&id)?;
        self.write_int(p.interfaces.len() as i32);
        for itf in &p.interfaces {
            self.write_type_or_index(&itf.0)?;
        }
        self.write_object(Some(&p.handler))
    }
}

fn write_index_command(out: &mut ByteWriter, idx: u32, base: u8) {
    if idx & 0xFFFF_0000 != 0 {
        if idx & 0xFF00_0000 != 0 {
            out.u8(base + 4);
            out.u32(idx);
        } else {
            out.u8(base + 3);
            out.u8((idx >> 16) as u8);
            out.u16(idx as u16);
        }
    } else if idx & 0xFF00 != 0 {
        out.u8(base + 2);
        out.u16(idx as u16);
    } else {
        out.u8(base + 1);
        out.u8(idx as u8);
    }
}

fn is_low_bytes(chars: impl Iterator<Item = char>) -> bool {
    let mut chars = chars;
    chars.all(|c| (c as u32) < 0x100)
}

fn common_prefix_chars(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count()
}

fn downcast<'o, T: Any>(o: &'o Obj, name: &str) -> Result<&'o T, WriteError> {
    o.downcast_ref::<T>()
        .ok_or_else(|| WriteError::Protocol(format!("codec type mismatch: {name}")))
}

fn array_kind_of(any: &dyn Any) -> Option<ArrayKind> {
    if any.is::<Vec<u8>>() {
        Some(ArrayKind::U8)
    } else if any.is::<Vec<i16>>() {
        Some(ArrayKind::I16)
    } else if any.is::<Vec<i32>>() {
        Some(ArrayKind::I32)
    } else if any.is::<Vec<i64>>() {
        Some(ArrayKind::I64)
    } else if any.is::<Vec<f32>>() {
        Some(ArrayKind::F32)
    } else if any.is::<Vec<f64>>() {
        Some(ArrayKind::F64)
    } else if any.is::<Vec<bool>>() {
        Some(ArrayKind::Bool)
    } else if any.is::<Vec<char>>() {
        Some(ArrayKind::Char)
    } else if any.is::<RefCell<Vec<Option<Obj>>>>() {
        Some(ArrayKind::Obj)
    } else {
        None
    }
}
