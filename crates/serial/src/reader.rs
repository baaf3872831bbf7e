//! `ContentReader` — reconstructs an object graph from the bytes a
//! [`ContentWriter`](crate::ContentWriter) produced.
//!
//! The protocol is positional: calls must mirror the write side in order and
//! arity. Each primitive read expects a whitelisted set of commands;
//! anything else is an [`ReadError::ObjectType`] and the offending command
//! stays buffered, so a caller can probe for the expected kind without
//! losing it. Payload-level failures are contained in the offending object's
//! slot: the remainder of its length-bounded region is pre-read (keeping the
//! slot tables in lockstep with the write side) and decoding continues after
//! the region.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use taskwire_buffers::ByteReader;

use crate::cmd;
use crate::error::ReadError;
use crate::object::{Obj, ProxyObject, TypeHandle};
use crate::registry::{ArrayKind, CodecKind, CodecRegistry, TypeCodec};
use crate::resolver::{DefaultSpaceResolver, SpaceHandle, SpaceResolver};
use crate::slot::{Slot, StringSlot};

/// Mutable cursor state of one (possibly nested) read scope.
///
/// A fresh state is pushed when entering a length-bounded sub-region and
/// popped afterwards, so a failing or non-exhaustive nested decode cannot
/// desynchronize the parent stream.
struct ReadState {
    /// Absolute end of the readable region (exclusive).
    end: usize,
    /// A command byte that was read but not yet consumed.
    pending: Option<u8>,
    /// Set once command reading failed terminally; holds the reason.
    dead: Option<String>,
    /// Bytes left of a bulk byte run.
    byte_remaining: usize,
    /// Chars left of a bulk char run.
    char_remaining: usize,
}

impl ReadState {
    fn new(end: usize) -> Self {
        Self {
            end,
            pending: None,
            dead: None,
            byte_remaining: 0,
            char_remaining: 0,
        }
    }
}

/// The decoder of the content serialization protocol.
///
/// Single-threaded and non-reentrant; slot state lives for the lifetime of
/// one logical read session and is never reset mid-stream.
pub struct ContentReader<'a> {
    input: ByteReader<'a>,
    state: ReadState,
    stack: Vec<ReadState>,
    registry: Arc<CodecRegistry>,
    resolver: Arc<dyn SpaceResolver>,
    objects: Vec<Slot>,
    strings: Vec<StringSlot>,
    warned_types: HashSet<String>,
}

impl<'a> ContentReader<'a> {
    /// Creates a reader over `data` with a default single-space resolver.
    pub fn new(registry: Arc<CodecRegistry>, data: &'a [u8]) -> Self {
        let resolver = Arc::new(DefaultSpaceResolver::new(registry.clone()));
        Self::with_resolver(registry, resolver, data)
    }

    pub fn with_resolver(
        registry: Arc<CodecRegistry>,
        resolver: Arc<dyn SpaceResolver>,
        data: &'a [u8],
    ) -> Self {
        Self {
            input: ByteReader::new(data),
            state: ReadState::new(data.len()),
            stack: Vec::new(),
            registry,
            resolver,
            objects: Vec::new(),
            strings: Vec::new(),
            warned_types: HashSet::new(),
        }
    }

    /// Raw access to the input cursor, for value codec payloads.
    pub fn raw_in(&mut self) -> &mut ByteReader<'a> {
        &mut self.input
    }

    /// Reads an untagged varint-length-prefixed UTF-8 string, bypassing the
    /// string table. The inverse of `ContentWriter::write_raw_utf`.
    pub fn read_raw_utf(&mut self) -> Result<String, ReadError> {
        let len = self.input.try_var_u32()? as usize;
        Ok(self.input.try_utf8(len)?.to_owned())
    }

    // ------------------------------------------------------------------
    // slot bookkeeping, also used by custom codec implementations
    // ------------------------------------------------------------------

    /// Occupies the next object slot with an `Unavailable` placeholder.
    pub fn reserve_slot(&mut self) -> usize {
        self.objects.push(Slot::Unavailable);
        self.objects.len() - 1
    }

    /// Registers a reconstructed object at the next slot.
    pub fn add_present(&mut self, o: Obj) -> usize {
        self.objects.push(Slot::Present(o));
        self.objects.len() - 1
    }

    /// Registers a failed object at the next slot.
    pub fn add_failed(&mut self, e: ReadError) -> usize {
        self.objects.push(Slot::Failed(e));
        self.objects.len() - 1
    }

    /// Replaces a slot with a reconstructed object.
    pub fn set_present(&mut self, idx: usize, o: Obj) {
        self.objects[idx] = Slot::Present(o);
    }

    /// Replaces a slot with a deferred failure.
    pub fn set_failed(&mut self, idx: usize, e: ReadError) {
        self.objects[idx] = Slot::Failed(e);
    }

    // ------------------------------------------------------------------
    // command handling
    // ------------------------------------------------------------------

    fn read_command_internal(&mut self) -> Result<(), ReadError> {
        if self.state.byte_remaining > 0 {
            return Err(ReadError::ObjectType(format!(
                "raw byte contents wasn't fully read ({} remaining)",
                self.state.byte_remaining
            )));
        }
        if self.state.char_remaining > 0 {
            return Err(ReadError::ObjectType(format!(
                "raw char contents wasn't fully read ({} remaining)",
                self.state.char_remaining
            )));
        }
        if let Some(reason) = &self.state.dead {
            return Err(ReadError::Eof(format!(
                "failed to read next serialization command ({reason})"
            )));
        }
        if self.state.pending.is_none() {
            let c = match self.input.try_u8() {
                Ok(c) => c,
                Err(_) => {
                    self.state.dead = Some("end of stream".into());
                    return Err(ReadError::Eof(
                        "failed to read next serialization command (end of stream)".into(),
                    ));
                }
            };
            if c == 0 || c > cmd::MAX_COMMAND {
                self.state.dead = Some(format!("unrecognized command: {c}"));
                return Err(ReadError::Protocol(format!(
                    "invalid next serialization command (unrecognized command: {c})"
                )));
            }
            self.state.pending = Some(c);
        }
        Ok(())
    }

    /// Consumes the next command if it is in `expected`; otherwise leaves it
    /// buffered and reports the mismatch.
    fn expect_commands(&mut self, expected: &[u8]) -> Result<u8, ReadError> {
        self.read_command_internal()?;
        let c = match self.state.pending {
            Some(c) => c,
            None => return Err(ReadError::Protocol("no pending command".into())),
        };
        if expected.contains(&c) {
            self.state.pending = None;
            Ok(c)
        } else {
            Err(ReadError::ObjectType(cmd::command_type_info(c).to_owned()))
        }
    }

    fn expect_command(&mut self, expected: u8) -> Result<(), ReadError> {
        self.read_command_internal()?;
        let c = match self.state.pending {
            Some(c) => c,
            None => return Err(ReadError::Protocol("no pending command".into())),
        };
        if c == expected {
            self.state.pending = None;
            Ok(())
        } else {
            Err(ReadError::ObjectType(cmd::command_type_info(c).to_owned()))
        }
    }

    /// Takes the next command without raising; `None` at end of the region
    /// or on a dead stream. Used by the pre-read machinery.
    fn take_command_if_any(&mut self) -> Option<u8> {
        if self.state.dead.is_some() {
            return None;
        }
        if let Some(c) = self.state.pending.take() {
            return Some(c);
        }
        match self.input.try_u8() {
            Err(_) => {
                self.state.dead = Some("end of stream".into());
                None
            }
            Ok(c) if c == 0 || c > cmd::MAX_COMMAND => {
                self.state.dead = Some(format!("unrecognized command: {c}"));
                None
            }
            Ok(c) => Some(c),
        }
    }

    // ------------------------------------------------------------------
    // nested regions
    // ------------------------------------------------------------------

    fn push_region(&mut self, len: usize) -> Result<(), ReadError> {
        let pos = self.input.pos();
        let new_end = pos
            .checked_add(len)
            .filter(|&e| e <= self.state.end)
            .ok_or_else(|| ReadError::Protocol(format!("invalid length read: {len}")))?;
        let outer = std::mem::replace(&mut self.state, ReadState::new(new_end));
        self.stack.push(outer);
        self.input.set_end(new_end);
        Ok(())
    }

    fn pop_region(&mut self) {
        // the declared length is authoritative: resync to the boundary no
        // matter where the nested decode stopped
        self.input.set_pos(self.state.end);
        if let Some(outer) = self.stack.pop() {
            self.input.set_end(outer.end);
            self.state = outer;
        }
    }

    // ------------------------------------------------------------------
    // primitive reads
    // ------------------------------------------------------------------

    pub fn read_boolean(&mut self) -> Result<bool, ReadError> {
        Ok(self.expect_commands(cmd::BOOLEAN_COMMANDS)? == cmd::BOOLEAN_TRUE)
    }

    pub fn read_byte(&mut self) -> Result<u8, ReadError> {
        if self.state.char_remaining > 0 {
            return Err(ReadError::ObjectType(format!(
                "raw char contents wasn't fully read ({} remaining)",
                self.state.char_remaining
            )));
        }
        if self.state.byte_remaining > 0 {
            self.state.byte_remaining -= 1;
            return Ok(self.input.try_u8()?);
        }
        loop {
            match self.expect_commands(cmd::BYTE_COMMANDS)? {
                cmd::BYTE => return Ok(self.input.try_u8()?),
                _ => {
                    let n = self.read_int()?;
                    if n <= 0 {
                        continue;
                    }
                    self.state.byte_remaining = n as usize - 1;
                    return Ok(self.input.try_u8()?);
                }
            }
        }
    }

    /// Reads up to `buf.len()` bytes, transparently crossing bulk-run
    /// boundaries. Returns the number of bytes read; a read never spans two
    /// runs in one call.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.state.char_remaining > 0 {
            return Err(ReadError::ObjectType(format!(
                "raw char contents wasn't fully read ({} remaining)",
                self.state.char_remaining
            )));
        }
        let mut off = 0;
        loop {
            if self.state.byte_remaining > 0 {
                let n = self.state.byte_remaining.min(buf.len() - off);
                let bytes = self.input.try_buf(n)?;
                buf[off..off + n].copy_from_slice(bytes);
                self.state.byte_remaining -= n;
                return Ok(off + n);
            }
            if off > 0 {
                return Ok(off);
            }
            match self.expect_commands(cmd::BYTE_COMMANDS)? {
                cmd::BYTE => {
                    buf[off] = self.input.try_u8()?;
                    off += 1;
                    if off == buf.len() {
                        return Ok(off);
                    }
                }
                _ => {
                    let n = self.read_int()?;
                    if n > 0 {
                        self.state.byte_remaining = n as usize;
                    }
                }
            }
        }
    }

    /// Fills `buf` completely or fails with an end-of-stream error.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), ReadError> {
        let mut off = 0;
        while off < buf.len() {
            let n = self.read(&mut buf[off..])?;
            if n == 0 {
                return Err(ReadError::Eof("end of stream".into()));
            }
            off += n;
        }
        Ok(())
    }

    /// Skips up to `n` bytes of a pending bulk byte run. Never skips chars
    /// or tagged content; returns the number of bytes skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        if n == 0 || self.state.byte_remaining == 0 {
            return 0;
        }
        let c = self.input.skip(n.min(self.state.byte_remaining));
        self.state.byte_remaining -= c;
        c
    }

    pub fn read_short(&mut self) -> Result<i16, ReadError> {
        match self.expect_commands(cmd::SHORT_COMMANDS)? {
            cmd::SHORT_1 => Ok(self.input.try_u8()? as i16),
            _ => Ok(self.input.try_i16()?),
        }
    }

    pub fn read_char(&mut self) -> Result<char, ReadError> {
        if self.state.byte_remaining > 0 {
            return Err(ReadError::ObjectType(format!(
                "raw byte contents wasn't fully read ({} remaining)",
                self.state.byte_remaining
            )));
        }
        if self.state.char_remaining > 0 {
            self.state.char_remaining -= 1;
            return self.read_char_scalar();
        }
        loop {
            match self.expect_commands(cmd::CHAR_COMMANDS)? {
                cmd::CHAR => return self.read_char_scalar(),
                _ => {
                    let n = self.read_int()?;
                    if n <= 0 {
                        continue;
                    }
                    self.state.char_remaining = n as usize - 1;
                    return self.read_char_scalar();
                }
            }
        }
    }

    fn read_char_scalar(&mut self) -> Result<char, ReadError> {
        let scalar = self.input.try_u32()?;
        char::from_u32(scalar)
            .ok_or_else(|| ReadError::Protocol(format!("invalid char scalar: {scalar}")))
    }

    pub fn read_int(&mut self) -> Result<i32, ReadError> {
        let c = self.expect_commands(cmd::INT_COMMANDS)?;
        Ok(match c {
            cmd::INT_1 => self.input.try_u8()? as i32,
            cmd::INT_2 => self.input.try_u16()? as i32,
            cmd::INT_3 => self.raw_u24()? as i32,
            cmd::INT_4 => self.input.try_i32()?,
            cmd::INT_F_1 => self.input.try_u8()? as i32 | 0xFFFF_FF00u32 as i32,
            cmd::INT_F_2 => self.input.try_u16()? as i32 | 0xFFFF_0000u32 as i32,
            cmd::INT_F_3 => (self.raw_u24()? | 0xFF00_0000) as i32,
            cmd::INT_ZERO => 0,
            cmd::INT_ONE => 1,
            cmd::INT_NEGATIVE_ONE => -1,
            _ => return Err(ReadError::Protocol(format!("invalid int command: {c}"))),
        })
    }

    pub fn read_long(&mut self) -> Result<i64, ReadError> {
        let c = self.expect_commands(cmd::LONG_COMMANDS)?;
        Ok(match c {
            cmd::LONG_2 => self.input.try_u16()? as i64,
            cmd::LONG_4 => self.input.try_u32()? as i64,
            cmd::LONG_6 => self.raw_u48()? as i64,
            cmd::LONG_8 => self.input.try_i64()?,
            cmd::LONG_F_2 => self.input.try_u16()? as i64 | 0xFFFF_FFFF_FFFF_0000u64 as i64,
            cmd::LONG_F_4 => self.input.try_u32()? as i64 | 0xFFFF_FFFF_0000_0000u64 as i64,
            cmd::LONG_F_6 => (self.raw_u48()? | 0xFFFF_0000_0000_0000) as i64,
            cmd::LONG_ZERO => 0,
            cmd::LONG_NEGATIVE_ONE => -1,
            _ => return Err(ReadError::Protocol(format!("invalid long command: {c}"))),
        })
    }

    pub fn read_float(&mut self) -> Result<f32, ReadError> {
        self.expect_command(cmd::FLOAT)?;
        Ok(self.input.try_f32()?)
    }

    pub fn read_double(&mut self) -> Result<f64, ReadError> {
        self.expect_command(cmd::DOUBLE)?;
        Ok(self.input.try_f64()?)
    }

    fn raw_u24(&mut self) -> Result<u32, ReadError> {
        let hi = self.input.try_u8()? as u32;
        let lo = self.input.try_u16()? as u32;
        Ok((hi << 16) | lo)
    }

    fn raw_u48(&mut self) -> Result<u64, ReadError> {
        let hi = self.input.try_u16()? as u64;
        let lo = self.input.try_u32()? as u64;
        Ok((hi << 32) | lo)
    }

    // ------------------------------------------------------------------
    // strings
    // ------------------------------------------------------------------

    pub fn read_utf(&mut self) -> Result<Rc<String>, ReadError> {
        let c = self.expect_commands(cmd::UTF_COMMANDS)?;
        self.read_utf_command(c)
    }

    fn read_utf_command(&mut self, c: u8) -> Result<Rc<String>, ReadError> {
        match c {
            cmd::UTF | cmd::OBJECT_UTF => self.read_utf_full(),
            cmd::UTF_LOWBYTES | cmd::OBJECT_UTF_LOWBYTES => self.read_utf_lowbytes(),
            cmd::UTF_PREFIXED | cmd::OBJECT_UTF_PREFIXED => self.read_utf_prefixed(false),
            cmd::UTF_PREFIXED_LOWBYTES | cmd::OBJECT_UTF_PREFIXED_LOWBYTES => {
                self.read_utf_prefixed(true)
            }
            cmd::UTF_IDX_1 | cmd::OBJECT_UTF_IDX_1 => {
                let idx = self.input.try_u8()? as u32;
                self.string_at(idx)
            }
            cmd::UTF_IDX_2 | cmd::OBJECT_UTF_IDX_2 => {
                let idx = self.input.try_u16()? as u32;
                self.string_at(idx)
            }
            cmd::UTF_IDX_3 | cmd::OBJECT_UTF_IDX_3 => {
                let idx = self.raw_u24()?;
                self.string_at(idx)
            }
            cmd::UTF_IDX_4 | cmd::OBJECT_UTF_IDX_4 => {
                let idx = self.input.try_u32()?;
                self.string_at(idx)
            }
            _ => Err(ReadError::Protocol(format!("invalid string command: {c}"))),
        }
    }

    fn string_at(&mut self, idx: u32) -> Result<Rc<String>, ReadError> {
        let size = self.strings.len();
        match self.strings.get(idx as usize) {
            Some(slot) => slot.get(),
            None => Err(ReadError::Protocol(format!(
                "invalid serialized string index: {idx} for size: {size}"
            ))),
        }
    }

    fn read_utf_full(&mut self) -> Result<Rc<String>, ReadError> {
        let res = (|| -> Result<Rc<String>, ReadError> {
            let len = self.input.try_var_u32()? as usize;
            let s = self.input.try_utf8(len)?;
            Ok(Rc::new(s.to_owned()))
        })();
        self.finish_string(res)
    }

    fn read_utf_lowbytes(&mut self) -> Result<Rc<String>, ReadError> {
        let res = (|| -> Result<Rc<String>, ReadError> {
            let len = self.input.try_var_u32()? as usize;
            let bytes = self.input.try_buf(len)?;
            Ok(Rc::new(bytes.iter().map(|&b| char::from(b)).collect()))
        })();
        self.finish_string(res)
    }

    fn read_utf_prefixed(&mut self, lowbytes: bool) -> Result<Rc<String>, ReadError> {
        let res = (|| -> Result<Rc<String>, ReadError> {
            let idx = self.input.try_var_u32()?;
            let common = self.input.try_var_u32()? as usize;
            let count = self.input.try_var_u32()? as usize;
            let payload = self.input.try_buf(count)?;
            let prefix = self.string_at(idx)?;
            let mut s = String::with_capacity(common + count);
            let mut taken = 0;
            for ch in prefix.chars().take(common) {
                s.push(ch);
                taken += 1;
            }
            if taken < common {
                return Err(ReadError::Protocol(format!(
                    "invalid common prefix length: {common} for prefix of {taken} chars"
                )));
            }
            if lowbytes {
                s.extend(payload.iter().map(|&b| char::from(b)));
            } else {
                let suffix = std::str::from_utf8(payload)
                    .map_err(|_| ReadError::Protocol("invalid utf-8 string content".into()))?;
                s.push_str(suffix);
            }
            Ok(Rc::new(s))
        })();
        self.finish_string(res)
    }

    /// Registers the outcome of a string decode in the string table; every
    /// newly decoded string occupies the next index, failed or not.
    fn finish_string(
        &mut self,
        res: Result<Rc<String>, ReadError>,
    ) -> Result<Rc<String>, ReadError> {
        match res {
            Ok(s) => {
                self.strings.push(StringSlot::Present(s.clone()));
                Ok(s)
            }
            Err(e) => {
                self.strings.push(StringSlot::Failed(e.clone()));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // objects
    // ------------------------------------------------------------------

    /// Reads an object graph node; `None` is the null object.
    pub fn read_object(&mut self) -> Result<Option<Obj>, ReadError> {
        let c = self.expect_commands(cmd::OBJECT_COMMANDS)?;
        match c {
            cmd::OBJECT_NULL => Ok(None),
            cmd::OBJECT_IDX_1 | cmd::OBJECT_IDX_2 | cmd::OBJECT_IDX_3 | cmd::OBJECT_IDX_4 => {
                let idx = self.read_index(c - cmd::OBJECT_IDX_BASE)?;
                self.object_at(idx).map(Some)
            }
            cmd::OBJECT_UTF
            | cmd::OBJECT_UTF_LOWBYTES
            | cmd::OBJECT_UTF_PREFIXED
            | cmd::OBJECT_UTF_PREFIXED_LOWBYTES
            | cmd::OBJECT_UTF_IDX_1
            | cmd::OBJECT_UTF_IDX_2
            | cmd::OBJECT_UTF_IDX_3
            | cmd::OBJECT_UTF_IDX_4 => {
                let s = self.read_utf_command(c)?;
                let o: Obj = s;
                Ok(Some(o))
            }
            cmd::OBJECT_ARRAY | cmd::OBJECT_ARRAY_ERROR => self.read_array(c).map(Some),
            cmd::OBJECT_EXTERNALIZABLE_1
            | cmd::OBJECT_EXTERNALIZABLE_4
            | cmd::OBJECT_EXTERNALIZABLE_ERROR => self.read_externalizable(c).map(Some),
            cmd::OBJECT_TYPE => self.read_type_impl().map(Some),
            cmd::OBJECT_SERIALIZABLE | cmd::OBJECT_SERIALIZABLE_ERROR => {
                self.read_native(c).map(Some)
            }
            cmd::OBJECT_CUSTOM_SERIALIZABLE | cmd::OBJECT_CUSTOM_SERIALIZABLE_ERROR => {
                self.read_custom(c).map(Some)
            }
            cmd::OBJECT_ENUM => self.read_enum().map(Some),
            cmd::OBJECT_VALUE => self.read_value().map(Some),
            cmd::OBJECT_CLASSLOADER => {
                let space = self.read_space_ref()?;
                Ok(Some(Rc::new(space) as Obj))
            }
            cmd::OBJECT_PROXY => self.read_proxy().map(Some),
            _ => Err(ReadError::Protocol(format!("invalid object command: {c}"))),
        }
    }

    fn read_index(&mut self, width: u8) -> Result<u32, ReadError> {
        Ok(match width {
            1 => self.input.try_u8()? as u32,
            2 => self.input.try_u16()? as u32,
            3 => self.raw_u24()?,
            _ => self.input.try_u32()?,
        })
    }

    fn object_at(&mut self, idx: u32) -> Result<Obj, ReadError> {
        let size = self.objects.len();
        match self.objects.get(idx as usize) {
            Some(slot) => slot.get(),
            None => Err(ReadError::Protocol(format!(
                "referenced object not found at index: {idx} (current size: {size})"
            ))),
        }
    }

    /// Resolves a type-space reference: an interned UTF resolver id, empty
    /// for the default space.
    fn read_space_ref(&mut self) -> Result<SpaceHandle, ReadError> {
        let id = self.read_utf()?;
        let id_opt = if id.is_empty() {
            None
        } else {
            Some(id.as_str())
        };
        self.resolver.space_for(id_opt).ok_or_else(|| {
            ReadError::Reflection(format!("no type space registered for resolver id: {id:?}"))
        })
    }

    /// Reads a full type reference. Both UTF fields are consumed before any
    /// resolution failure is raised, so the stream stays in sync.
    fn read_external_class(&mut self) -> Result<Arc<TypeCodec>, ReadError> {
        let id = self.read_utf()?;
        let space = self.resolver.space_for(if id.is_empty() {
            None
        } else {
            Some(id.as_str())
        });
        let name = self.read_utf()?;
        let space = space.ok_or_else(|| {
            ReadError::Reflection(format!("no type space registered for resolver id: {id:?}"))
        })?;
        space.0.type_by_name(&name).ok_or_else(|| {
            ReadError::Reflection(format!("type not found: {name} (resolver id: {id:?})"))
        })
    }

    fn read_type_impl(&mut self) -> Result<Obj, ReadError> {
        match self.read_external_class() {
            Ok(codec) => {
                let handle: Obj = Rc::new(TypeHandle(codec));
                self.objects.push(Slot::Present(handle.clone()));
                Ok(handle)
            }
            Err(e) => {
                self.objects.push(Slot::Failed(e.clone()));
                Err(e)
            }
        }
    }

    fn read_type_with_command(&mut self) -> Result<Arc<TypeCodec>, ReadError> {
        let handle = match self.expect_commands(cmd::TYPE_COMMANDS)? {
            cmd::OBJECT_TYPE => self.read_type_impl()?,
            c => {
                let idx = self.read_index(c - cmd::OBJECT_IDX_BASE)?;
                self.object_at(idx)?
            }
        };
        handle
            .downcast_ref::<TypeHandle>()
            .map(|t| t.0.clone())
            .ok_or_else(|| ReadError::ObjectType("object (type)".into()))
    }

    fn raw_array_len(&mut self) -> Result<usize, ReadError> {
        let len = self.input.try_i32()?;
        if len < 0 {
            return Err(ReadError::Protocol(format!("invalid length read: {len}")));
        }
        Ok(len as usize)
    }

    fn read_array(&mut self, c: u8) -> Result<Obj, ReadError> {
        let codec = match self.read_type_with_command() {
            Ok(codec) => codec,
            Err(e) => {
                let len = self.raw_array_len()?;
                let err = ReadError::wrap("object (array)", e);
                self.objects.push(Slot::Failed(err.clone()));
                for _ in 0..len {
                    self.pre_read_single();
                }
                return Err(err);
            }
        };
        let len = self.raw_array_len()?;
        if c == cmd::OBJECT_ARRAY_ERROR {
            let err = ReadError::ObjectWrite(codec.name.clone());
            self.objects.push(Slot::Failed(err.clone()));
            for _ in 0..len {
                self.pre_read_single();
            }
            return Err(err);
        }
        let CodecKind::Array(kind) = &codec.kind else {
            return Err(ReadError::ObjectType("object (array)".into()));
        };
        let kind = *kind;
        if kind == ArrayKind::Obj {
            let handle: Obj = Rc::new(RefCell::new(Vec::<Option<Obj>>::with_capacity(
                len.min(1024),
            )));
            let slot = self.add_present(handle.clone());
            for i in 0..len {
                match self.read_object() {
                    Ok(v) => {
                        if let Some(cell) = handle.downcast_ref::<RefCell<Vec<Option<Obj>>>>() {
                            cell.borrow_mut().push(v);
                        }
                    }
                    Err(e) => {
                        let err =
                            ReadError::wrap(format!("array element at index: {i}"), e);
                        self.set_failed(slot, err.clone());
                        for _ in i + 1..len {
                            self.pre_read_single();
                        }
                        return Err(err);
                    }
                }
            }
            return Ok(handle);
        }
        let slot = self.reserve_slot();
        match self.read_primitive_array(kind, len) {
            Ok(o) => {
                self.set_present(slot, o.clone());
                Ok(o)
            }
            Err(e) => {
                let err = ReadError::wrap(codec.name.clone(), e);
                self.set_failed(slot, err.clone());
                Err(err)
            }
        }
    }

    fn read_primitive_array(&mut self, kind: ArrayKind, len: usize) -> Result<Obj, ReadError> {
        let cap = len.min(4096);
        Ok(match kind {
            ArrayKind::U8 => Rc::new(self.input.try_buf(len)?.to_vec()) as Obj,
            ArrayKind::I16 => {
                let mut v = Vec::with_capacity(cap);
                for _ in 0..len {
                    v.push(self.input.try_i16()?);
                }
                Rc::new(v) as Obj
            }
            ArrayKind::I32 => {
                let mut v = Vec::with_capacity(cap);
                for _ in 0..len {
                    v.push(self.input.try_i32()?);
                }
                Rc::new(v) as Obj
            }
            ArrayKind::I64 => {
                let mut v = Vec::with_capacity(cap);
                for _ in 0..len {
                    v.push(self.input.try_i64()?);
                }
                Rc::new(v) as Obj
            }
            ArrayKind::F32 => {
                let mut v = Vec::with_capacity(cap);
                for _ in 0..len {
                    v.push(self.input.try_f32()?);
                }
                Rc::new(v) as Obj
            }
            ArrayKind::F64 => {
                let mut v = Vec::with_capacity(cap);
                for _ in 0..len {
                    v.push(self.input.try_f64()?);
                }
                Rc::new(v) as Obj
            }
            ArrayKind::Bool => {
                let mut v = Vec::with_capacity(cap);
                for _ in 0..len {
                    v.push(self.input.try_u8()? != 0);
                }
                Rc::new(v) as Obj
            }
            ArrayKind::Char => {
                let mut v = Vec::with_capacity(cap);
                for _ in 0..len {
                    let scalar = self.input.try_u32()?;
                    v.push(char::from_u32(scalar).ok_or_else(|| {
                        ReadError::Protocol(format!("invalid char scalar: {scalar}"))
                    })?);
                }
                Rc::new(v) as Obj
            }
            ArrayKind::Obj => {
                return Err(ReadError::Protocol(
                    "object array is not a primitive array".into(),
                ))
            }
        })
    }

    fn read_externalizable_length(&mut self, c: u8) -> Result<usize, ReadError> {
        let len = match c {
            cmd::OBJECT_EXTERNALIZABLE_1 => self.input.try_u8()? as i32,
            _ => self.input.try_i32()?,
        };
        if len < 0 {
            return Err(ReadError::Protocol(format!("invalid length read: {len}")));
        }
        Ok(len as usize)
    }

    fn read_externalizable(&mut self, c: u8) -> Result<Obj, ReadError> {
        let codec = match self.read_type_with_command() {
            Ok(codec) => codec,
            Err(e) => {
                let err = ReadError::wrap("object (Externalizable)", e);
                self.objects.push(Slot::Failed(err.clone()));
                let len = self.read_externalizable_length(c)?;
                self.pre_read_region(len)?;
                return Err(err);
            }
        };
        let len = self.read_externalizable_length(c)?;
        if c == cmd::OBJECT_EXTERNALIZABLE_ERROR {
            let err = ReadError::ObjectWrite(codec.name.clone());
            self.objects.push(Slot::Failed(err.clone()));
            self.pre_read_region(len)?;
            return Err(err);
        }
        let CodecKind::External(vt) = &codec.kind else {
            let err = ReadError::Reflection(format!(
                "failed to instantiate externalizable: {}",
                codec.name
            ));
            self.objects.push(Slot::Failed(err.clone()));
            self.pre_read_region(len)?;
            return Err(err);
        };
        let instance = (vt.create)();
        let slot = self.add_present(instance.clone());
        self.push_region(len)?;
        let res = (vt.read_content)(&instance, self);
        if res.is_ok() && self.input.remaining() > 0 {
            self.warn_not_fully_read(&codec.name);
        }
        let result = match res {
            Ok(()) => Ok(instance),
            Err(e) => {
                let err = ReadError::wrap(codec.name.clone(), e);
                self.set_failed(slot, err.clone());
                Err(err)
            }
        };
        self.pre_read_remaining();
        self.pop_region();
        result
    }

    fn read_custom(&mut self, c: u8) -> Result<Obj, ReadError> {
        let codec = self.read_type_with_command()?;
        let len = {
            let l = self.input.try_i32()?;
            if l < 0 {
                return Err(ReadError::Protocol(format!("invalid length read: {l}")));
            }
            l as usize
        };
        self.push_region(len)?;
        let result = if c == cmd::OBJECT_CUSTOM_SERIALIZABLE_ERROR {
            let err = ReadError::ObjectWrite(codec.name.clone());
            self.objects.push(Slot::Failed(err.clone()));
            Err(err)
        } else if let CodecKind::Custom { read, .. } = &codec.kind {
            let out = read(self);
            if out.is_ok() && self.input.remaining() > 0 {
                self.warn_not_fully_read(&codec.name);
            }
            out
        } else {
            let err = ReadError::Protocol(format!(
                "no object reader found for class: {}",
                codec.name
            ));
            self.objects.push(Slot::Failed(err.clone()));
            Err(err)
        };
        self.pre_read_remaining();
        self.pop_region();
        result
    }

    fn read_native(&mut self, c: u8) -> Result<Obj, ReadError> {
        let len = {
            let l = self.input.try_i32()?;
            if l < 0 {
                return Err(ReadError::Protocol(format!("invalid length read: {l}")));
            }
            l as usize
        };
        let region = self.input.try_buf(len)?;
        if c == cmd::OBJECT_SERIALIZABLE_ERROR {
            let err = ReadError::ObjectWrite("native-serialized object".into());
            self.objects.push(Slot::Failed(err.clone()));
            return Err(err);
        }
        let mut r = ByteReader::new(region);
        let parsed = (|| -> Result<Obj, ReadError> {
            let name_len = r.try_var_u32()? as usize;
            let name = r.try_utf8(name_len)?;
            let codec = self.registry.type_by_name(name).ok_or_else(|| {
                ReadError::Protocol(format!("no native reader found for class: {name}"))
            })?;
            let CodecKind::Native { read, .. } = &codec.kind else {
                return Err(ReadError::ObjectType("object (Serializable)".into()));
            };
            let rest = r.try_buf(r.remaining())?;
            read(rest)
        })();
        match parsed {
            Ok(o) => {
                self.objects.push(Slot::Present(o.clone()));
                Ok(o)
            }
            Err(e) => {
                let err = ReadError::wrap("object (Serializable)", e);
                self.objects.push(Slot::Failed(err.clone()));
                Err(err)
            }
        }
    }

    fn read_enum(&mut self) -> Result<Obj, ReadError> {
        let codec = match self.read_type_with_command() {
            Ok(codec) => codec,
            Err(e) => {
                // consume the variant name regardless to keep the protocol
                // in sync
                let name = self.read_raw_utf()?;
                let err = ReadError::wrap(
                    format!("enum class not found for enum name: {name}"),
                    e,
                );
                self.objects.push(Slot::Failed(err.clone()));
                return Err(err);
            }
        };
        let name = self.read_raw_utf()?;
        let CodecKind::Enum { from_variant, .. } = &codec.kind else {
            let err = ReadError::ObjectType("object (enum)".into());
            self.objects.push(Slot::Failed(err.clone()));
            return Err(err);
        };
        match from_variant(&name) {
            Some(o) => {
                self.objects.push(Slot::Present(o.clone()));
                Ok(o)
            }
            None => {
                let err = ReadError::Reflection(format!(
                    "enum value not found: {}.{name}",
                    codec.name
                ));
                self.objects.push(Slot::Failed(err.clone()));
                Err(err)
            }
        }
    }

    fn read_value(&mut self) -> Result<Obj, ReadError> {
        let name = self.read_utf()?;
        // an unknown value reader is fatal: value payloads carry no length
        // field, so there is nothing to skip by
        let vc = self.registry.value_by_name(&name).ok_or_else(|| {
            ReadError::Protocol(format!("no value object reader found for class: {name}"))
        })?;
        (vc.read)(self)
    }

    fn read_proxy(&mut self) -> Result<Obj, ReadError> {
        let slot = self.reserve_slot();
        // collect resolution failures so the handler object is still read
        // and the byte cursor stays correct
        let mut collected: Vec<ReadError> = Vec::new();
        let space = match self.read_space_ref() {
            Ok(s) => Some(s),
            Err(e) => {
                collected.push(e);
                None
            }
        };
        let count = match self.read_int() {
            Ok(n) if n >= 0 => n as usize,
            Ok(n) => {
                return Err(ReadError::Protocol(format!(
                    "invalid proxy interface count: {n}"
                )))
            }
            Err(e) => {
                let err = ReadError::wrap("object (proxy)", e.clone());
                self.set_failed(slot, err);
                return Err(e);
            }
        };
        let mut interfaces = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            match self.read_type_with_command() {
                Ok(codec) => interfaces.push(TypeHandle(codec)),
                Err(e) => collected.push(e),
            }
        }
        let handler = match self.read_object() {
            Ok(h) => h,
            Err(e) => {
                let err = ReadError::wrap("object (proxy)", e);
                self.set_failed(slot, err.clone());
                return Err(err);
            }
        };
        if let Some(first) = collected.into_iter().next() {
            let err = ReadError::wrap("object (proxy)", first);
            self.set_failed(slot, err.clone());
            return Err(err);
        }
        let handler = match handler {
            Some(h) => h,
            None => {
                let err = ReadError::ObjectType("proxy invocation handler is null".into());
                self.set_failed(slot, err.clone());
                return Err(err);
            }
        };
        let proxy: Obj = Rc::new(ProxyObject {
            space,
            interfaces,
            handler,
        });
        self.set_present(slot, proxy.clone());
        Ok(proxy)
    }

    fn warn_not_fully_read(&mut self, type_name: &str) {
        if self.warned_types.insert(type_name.to_owned()) {
            tracing::warn!(
                type_name = %type_name,
                "did not fully read object content from the stream"
            );
        }
    }

    // ------------------------------------------------------------------
    // pre-read: structurally consume content to keep the cursor and the
    // slot tables in lockstep, swallowing payload errors
    // ------------------------------------------------------------------

    fn pre_read_region(&mut self, len: usize) -> Result<(), ReadError> {
        if len == 0 {
            return Ok(());
        }
        self.push_region(len)?;
        self.pre_read_remaining();
        self.pop_region();
        Ok(())
    }

    fn pre_read_remaining(&mut self) {
        let bytes = self.state.byte_remaining;
        if bytes > 0 {
            self.input.skip(bytes);
            self.state.byte_remaining = 0;
        }
        let chars = self.state.char_remaining;
        if chars > 0 {
            self.input.skip(chars * 4);
            self.state.char_remaining = 0;
        }
        while let Some(c) = self.take_command_if_any() {
            self.pre_read_command(c);
        }
    }

    fn pre_read_single(&mut self) {
        if let Some(c) = self.take_command_if_any() {
            self.pre_read_command(c);
        }
    }

    fn pre_read_command(&mut self, c: u8) {
        // payload errors are already contained in slots; anything else the
        // region boundary will resynchronize
        let _ = self.pre_read_command_inner(c);
    }

    fn pre_read_command_inner(&mut self, c: u8) -> Result<(), ReadError> {
        match c {
            cmd::OBJECT_ARRAY | cmd::OBJECT_ARRAY_ERROR => {
                self.read_array(c)?;
            }
            cmd::OBJECT_SERIALIZABLE | cmd::OBJECT_SERIALIZABLE_ERROR => {
                self.read_native(c)?;
            }
            cmd::OBJECT_CUSTOM_SERIALIZABLE | cmd::OBJECT_CUSTOM_SERIALIZABLE_ERROR => {
                self.read_custom(c)?;
            }
            cmd::OBJECT_TYPE => {
                self.read_type_impl()?;
            }
            cmd::OBJECT_EXTERNALIZABLE_1
            | cmd::OBJECT_EXTERNALIZABLE_4
            | cmd::OBJECT_EXTERNALIZABLE_ERROR => {
                self.read_externalizable(c)?;
            }
            cmd::OBJECT_ENUM => {
                self.read_enum()?;
            }
            cmd::OBJECT_VALUE => {
                self.read_value()?;
            }
            cmd::OBJECT_NULL => {}
            cmd::OBJECT_IDX_1 | cmd::OBJECT_IDX_2 | cmd::OBJECT_IDX_3 | cmd::OBJECT_IDX_4 => {
                self.read_index(c - cmd::OBJECT_IDX_BASE)?;
            }
            cmd::OBJECT_PROXY => {
                self.read_proxy()?;
            }
            cmd::UTF | cmd::OBJECT_UTF => {
                self.read_utf_full()?;
            }
            cmd::UTF_LOWBYTES | cmd::OBJECT_UTF_LOWBYTES => {
                self.read_utf_lowbytes()?;
            }
            cmd::UTF_PREFIXED | cmd::OBJECT_UTF_PREFIXED => {
                self.read_utf_prefixed(false)?;
            }
            cmd::UTF_PREFIXED_LOWBYTES | cmd::OBJECT_UTF_PREFIXED_LOWBYTES => {
                self.read_utf_prefixed(true)?;
            }
            cmd::UTF_IDX_1 | cmd::OBJECT_UTF_IDX_1 => {
                self.input.try_u8()?;
            }
            cmd::UTF_IDX_2 | cmd::OBJECT_UTF_IDX_2 => {
                self.input.try_u16()?;
            }
            cmd::UTF_IDX_3 | cmd::OBJECT_UTF_IDX_3 => {
                self.raw_u24()?;
            }
            cmd::UTF_IDX_4 | cmd::OBJECT_UTF_IDX_4 => {
                self.input.try_u32()?;
            }
            cmd::BOOLEAN_TRUE | cmd::BOOLEAN_FALSE => {}
            cmd::BYTE => {
                self.input.try_u8()?;
            }
            cmd::BYTEARRAY => {
                let len = self.read_int()?;
                if len < 0 {
                    return Err(ReadError::Protocol(format!("invalid length read: {len}")));
                }
                self.input.skip(len as usize);
            }
            cmd::CHAR => {
                self.input.try_u32()?;
            }
            cmd::CHARS => {
                let count = self.read_int()?;
                if count < 0 {
                    return Err(ReadError::Protocol(format!(
                        "invalid length read: {count}"
                    )));
                }
                self.input.skip(count as usize * 4);
            }
            cmd::DOUBLE => {
                self.input.try_f64()?;
            }
            cmd::FLOAT => {
                self.input.try_f32()?;
            }
            cmd::INT_1 | cmd::INT_F_1 => {
                self.input.try_u8()?;
            }
            cmd::INT_2 | cmd::INT_F_2 => {
                self.input.try_u16()?;
            }
            cmd::INT_3 | cmd::INT_F_3 => {
                self.raw_u24()?;
            }
            cmd::INT_4 => {
                self.input.try_u32()?;
            }
            cmd::INT_ZERO | cmd::INT_ONE | cmd::INT_NEGATIVE_ONE => {}
            cmd::LONG_8 => {
                self.input.try_u64()?;
            }
            cmd::LONG_2 | cmd::LONG_F_2 => {
                self.input.try_u16()?;
            }
            cmd::LONG_4 | cmd::LONG_F_4 => {
                self.input.try_u32()?;
            }
            cmd::LONG_6 | cmd::LONG_F_6 => {
                self.raw_u48()?;
            }
            cmd::LONG_ZERO | cmd::LONG_NEGATIVE_ONE => {}
            cmd::SHORT_1 => {
                self.input.try_u8()?;
            }
            cmd::SHORT_2 => {
                self.input.try_u16()?;
            }
            cmd::OBJECT_CLASSLOADER => {
                self.read_utf()?;
            }
            _ => {
                return Err(ReadError::Protocol(format!("invalid command: {c}")));
            }
        }
        Ok(())
    }
}
