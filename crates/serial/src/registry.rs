//! The static per-type codec registry.
//!
//! A registry is populated once at startup and then frozen behind an `Arc`;
//! both the encoder and the decoder hold a read-only reference to the same
//! instance. [`CodecRegistry::with_defaults`] pre-populates the well-known
//! container and boxed-value types; everything else is added through the
//! `register_*` functions, keyed by the concrete runtime type on the write
//! side and by the registered name on the read side.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ReadError, WriteError};
use crate::object::Obj;
use crate::reader::ContentReader;
use crate::writer::ContentWriter;

/// A type that serializes itself field-by-field through the content codec.
///
/// `read_content` runs against an already-constructed (and already
/// slot-registered) instance, so cyclic graphs terminate through index
/// back-references; fields that can participate in cycles use interior
/// mutability.
pub trait Externalizable: Any {
    fn write_content(&self, out: &mut ContentWriter) -> Result<(), WriteError>;
    fn read_content(&self, input: &mut ContentReader<'_>) -> Result<(), ReadError>;
}

/// Equality key of a registered boxed value, used by the write-side value
/// interning table. Float keys carry the bit pattern so `NaN` still interns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    Bits32(u32),
    Bits64(u64),
    Bool(bool),
    Char(char),
    Text(String),
}

pub(crate) type WriteFn =
    Box<dyn Fn(&dyn Any, &mut ContentWriter) -> Result<(), WriteError> + Send + Sync>;
pub(crate) type ReadFn =
    Box<dyn Fn(&mut ContentReader<'_>) -> Result<Obj, ReadError> + Send + Sync>;

pub(crate) struct ExternalVtable {
    pub create: Box<dyn Fn() -> Obj + Send + Sync>,
    pub write: WriteFn,
    pub read_content:
        Box<dyn Fn(&Obj, &mut ContentReader<'_>) -> Result<(), ReadError> + Send + Sync>,
    pub intern: Option<InternVtable>,
}

/// Erased per-type equality intern table operations for externalizable value
/// types. The tables themselves live in the writer, one per type.
pub(crate) struct InternVtable {
    pub new_table: fn() -> Box<dyn Any>,
    pub get: fn(&dyn Any, &dyn Any) -> Option<u32>,
    pub insert: fn(&mut dyn Any, &dyn Any, u32),
}

fn intern_new<T: Any + Eq + Hash + Clone>() -> Box<dyn Any> {
    Box::new(HashMap::<T, u32>::new())
}

fn intern_get<T: Any + Eq + Hash + Clone>(table: &dyn Any, value: &dyn Any) -> Option<u32> {
    let table = table.downcast_ref::<HashMap<T, u32>>()?;
    let value = value.downcast_ref::<T>()?;
    table.get(value).copied()
}

fn intern_insert<T: Any + Eq + Hash + Clone>(table: &mut dyn Any, value: &dyn Any, index: u32) {
    if let Some(table) = table.downcast_mut::<HashMap<T, u32>>() {
        if let Some(value) = value.downcast_ref::<T>() {
            table.insert(value.clone(), index);
        }
    }
}

/// The nine array kinds the codec special-cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ArrayKind {
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
    Char,
    Obj,
}

pub(crate) enum CodecKind {
    External(ExternalVtable),
    Custom { write: WriteFn, read: ReadFn },
    Native {
        write: Box<dyn Fn(&dyn Any, &mut Vec<u8>) -> Result<(), WriteError> + Send + Sync>,
        read: Box<dyn Fn(&[u8]) -> Result<Obj, ReadError> + Send + Sync>,
    },
    Enum {
        variant: Box<dyn Fn(&dyn Any) -> Option<&'static str> + Send + Sync>,
        from_variant: Box<dyn Fn(&str) -> Option<Obj> + Send + Sync>,
    },
    Array(ArrayKind),
}

/// One registered type: its wire name and how to encode/decode instances.
pub struct TypeCodec {
    pub name: String,
    pub(crate) kind: CodecKind,
}

pub(crate) struct ValueCodec {
    pub name: String,
    pub write: WriteFn,
    pub read: ReadFn,
    pub key: Box<dyn Fn(&dyn Any) -> Option<ValueKey> + Send + Sync>,
}

/// Registry of every codec a type space knows.
#[derive(Default)]
pub struct CodecRegistry {
    types_by_name: HashMap<String, Arc<TypeCodec>>,
    types_by_id: HashMap<TypeId, Arc<TypeCodec>>,
    values_by_name: HashMap<String, Arc<ValueCodec>>,
    values_by_id: HashMap<TypeId, Arc<ValueCodec>>,
    arrays: HashMap<ArrayKind, Arc<TypeCodec>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the well-known container and value
    /// types: string-keyed ordered/hash maps, ordered/hash string sets, an
    /// object list, `Option`, the array kinds, and the boxed scalar values
    /// (`u8`, `i16`, `i32`, `i64`, `f32`, `f64`, `bool`, `char`, `Uuid`,
    /// `SystemTime`, `PathBuf`).
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.install_defaults();
        r
    }

    fn add_type<T: Any>(&mut self, codec: TypeCodec) {
        let codec = Arc::new(codec);
        self.types_by_name.insert(codec.name.clone(), codec.clone());
        self.types_by_id.insert(TypeId::of::<T>(), codec);
    }

    fn add_value<T: Any>(&mut self, codec: ValueCodec) {
        let codec = Arc::new(codec);
        self.values_by_name.insert(codec.name.clone(), codec.clone());
        self.values_by_id.insert(TypeId::of::<T>(), codec);
    }

    fn add_array<T: Any>(&mut self, kind: ArrayKind, name: &'static str) {
        let codec = Arc::new(TypeCodec {
            name: name.to_owned(),
            kind: CodecKind::Array(kind),
        });
        self.types_by_name.insert(name.to_owned(), codec.clone());
        self.types_by_id.insert(TypeId::of::<T>(), codec.clone());
        self.arrays.insert(kind, codec);
    }

    /// Registers an [`Externalizable`] type.
    pub fn register_external<T: Externalizable + Default>(&mut self, name: &'static str) {
        self.add_type::<T>(TypeCodec {
            name: name.to_owned(),
            kind: CodecKind::External(external_vtable::<T>(name, None)),
        });
    }

    /// Registers an [`Externalizable`] value type: semantically equal
    /// instances collapse to one wire occurrence, on top of identity dedup.
    pub fn register_external_value<T>(&mut self, name: &'static str)
    where
        T: Externalizable + Default + Eq + Hash + Clone,
    {
        let intern = InternVtable {
            new_table: intern_new::<T>,
            get: intern_get::<T>,
            insert: intern_insert::<T>,
        };
        self.add_type::<T>(TypeCodec {
            name: name.to_owned(),
            kind: CodecKind::External(external_vtable::<T>(name, Some(intern))),
        });
    }

    /// Registers a custom per-type codec. The read closure owns its slot
    /// bookkeeping: it must register exactly one object slot (present or
    /// failed) to stay in lockstep with the write side.
    pub fn register_custom<T, W, R>(&mut self, name: &'static str, write: W, read: R)
    where
        T: Any,
        W: Fn(&T, &mut ContentWriter) -> Result<(), WriteError> + Send + Sync + 'static,
        R: Fn(&mut ContentReader<'_>) -> Result<Obj, ReadError> + Send + Sync + 'static,
    {
        self.add_type::<T>(TypeCodec {
            name: name.to_owned(),
            kind: CodecKind::Custom {
                write: Box::new(move |any, w| {
                    let v = any.downcast_ref::<T>().ok_or_else(|| {
                        WriteError::Protocol(format!("custom codec type mismatch: {name}"))
                    })?;
                    write(v, w)
                }),
                read: Box::new(read),
            },
        });
    }

    /// Registers a container codec: the instance is created and its slot
    /// registered before the body is read, so containers can participate in
    /// cycles.
    fn register_container<T, WB, RB>(
        &mut self,
        name: &'static str,
        write_body: WB,
        new: fn() -> T,
        read_body: RB,
    ) where
        T: Any,
        WB: Fn(&T, &mut ContentWriter) -> Result<(), WriteError> + Send + Sync + 'static,
        RB: Fn(&T, &mut ContentReader<'_>) -> Result<(), ReadError> + Send + Sync + 'static,
    {
        self.register_custom::<T, _, _>(name, write_body, move |r| {
            let handle: Obj = Rc::new(new());
            let idx = r.add_present(handle.clone());
            let res = match handle.downcast_ref::<T>() {
                Some(t) => read_body(t, r),
                None => Err(ReadError::Protocol(format!(
                    "container codec type mismatch: {name}"
                ))),
            };
            match res {
                Ok(()) => Ok(handle),
                Err(e) => {
                    let err = ReadError::wrap(name, e);
                    r.set_failed(idx, err.clone());
                    Err(err)
                }
            }
        });
    }

    /// Registers a type for the native-serialization fallback: instances are
    /// carried as a self-describing CBOR region.
    pub fn register_native<T>(&mut self, name: &'static str)
    where
        T: Any + Serialize + DeserializeOwned,
    {
        self.add_type::<T>(TypeCodec {
            name: name.to_owned(),
            kind: CodecKind::Native {
                write: Box::new(move |any, out| {
                    let v = any.downcast_ref::<T>().ok_or_else(|| {
                        WriteError::Protocol(format!("native codec type mismatch: {name}"))
                    })?;
                    ciborium::ser::into_writer(v, &mut *out).map_err(|e| {
                        WriteError::Message(format!("native serialization failed: {e}"))
                    })
                }),
                read: Box::new(|bytes| {
                    let v: T = ciborium::de::from_reader(bytes).map_err(|e| {
                        ReadError::Message(format!("native deserialization failed: {e}"))
                    })?;
                    Ok(Rc::new(v) as Obj)
                }),
            },
        });
    }

    /// Registers a unit-variant enum type, serialized by variant name.
    pub fn register_enum<T: Any>(
        &mut self,
        name: &'static str,
        variant: fn(&T) -> &'static str,
        from_variant: fn(&str) -> Option<T>,
    ) {
        self.add_type::<T>(TypeCodec {
            name: name.to_owned(),
            kind: CodecKind::Enum {
                variant: Box::new(move |any| any.downcast_ref::<T>().map(variant)),
                from_variant: Box::new(move |s| from_variant(s).map(|v| Rc::new(v) as Obj)),
            },
        });
    }

    /// Registers a boxed value type with a dedicated compact payload
    /// encoding and equality interning.
    pub fn register_value<T, W, R, K>(&mut self, name: &'static str, write: W, read: R, key: K)
    where
        T: Any,
        W: Fn(&T, &mut ContentWriter) -> Result<(), WriteError> + Send + Sync + 'static,
        R: Fn(&mut ContentReader<'_>) -> Result<T, ReadError> + Send + Sync + 'static,
        K: Fn(&T) -> ValueKey + Send + Sync + 'static,
    {
        self.add_value::<T>(ValueCodec {
            name: name.to_owned(),
            write: Box::new(move |any, w| {
                let v = any.downcast_ref::<T>().ok_or_else(|| {
                    WriteError::Protocol(format!("value codec type mismatch: {name}"))
                })?;
                write(v, w)
            }),
            read: Box::new(move |r| match read(r) {
                Ok(v) => {
                    let o: Obj = Rc::new(v);
                    r.add_present(o.clone());
                    Ok(o)
                }
                Err(e) => {
                    let err = ReadError::wrap(name, e);
                    r.add_failed(err.clone());
                    Err(err)
                }
            }),
            key: Box::new(move |any| any.downcast_ref::<T>().map(|v| key(v))),
        });
    }

    pub fn type_by_name(&self, name: &str) -> Option<Arc<TypeCodec>> {
        self.types_by_name.get(name).cloned()
    }

    pub(crate) fn type_by_id(&self, id: TypeId) -> Option<Arc<TypeCodec>> {
        self.types_by_id.get(&id).cloned()
    }

    pub(crate) fn value_by_id(&self, id: TypeId) -> Option<Arc<ValueCodec>> {
        self.values_by_id.get(&id).cloned()
    }

    pub(crate) fn value_by_name(&self, name: &str) -> Option<Arc<ValueCodec>> {
        self.values_by_name.get(name).cloned()
    }

    pub(crate) fn array_codec(&self, kind: ArrayKind) -> Option<Arc<TypeCodec>> {
        self.arrays.get(&kind).cloned()
    }

    fn install_defaults(&mut self) {
        self.add_array::<Vec<u8>>(ArrayKind::U8, "u8[]");
        self.add_array::<Vec<i16>>(ArrayKind::I16, "i16[]");
        self.add_array::<Vec<i32>>(ArrayKind::I32, "i32[]");
        self.add_array::<Vec<i64>>(ArrayKind::I64, "i64[]");
        self.add_array::<Vec<f32>>(ArrayKind::F32, "f32[]");
        self.add_array::<Vec<f64>>(ArrayKind::F64, "f64[]");
        self.add_array::<Vec<bool>>(ArrayKind::Bool, "bool[]");
        self.add_array::<Vec<char>>(ArrayKind::Char, "char[]");
        self.add_array::<RefCell<Vec<Option<Obj>>>>(ArrayKind::Obj, "obj[]");

        self.register_container::<RefCell<BTreeMap<String, Option<Obj>>>, _, _>(
            "map.btree",
            |m, w| {
                let m = m.borrow();
                w.write_int(m.len() as i32);
                for (k, v) in m.iter() {
                    w.write_utf(k)?;
                    w.write_object(v.as_ref())?;
                }
                Ok(())
            },
            || RefCell::new(BTreeMap::new()),
            |m, r| {
                let n = read_element_count(r)?;
                for _ in 0..n {
                    let k = r.read_utf()?;
                    let v = r.read_object()?;
                    m.borrow_mut().insert((*k).clone(), v);
                }
                Ok(())
            },
        );
        self.register_container::<RefCell<HashMap<String, Option<Obj>>>, _, _>(
            "map.hash",
            |m, w| {
                let m = m.borrow();
                w.write_int(m.len() as i32);
                for (k, v) in m.iter() {
                    w.write_utf(k)?;
                    w.write_object(v.as_ref())?;
                }
                Ok(())
            },
            || RefCell::new(HashMap::new()),
            |m, r| {
                let n = read_element_count(r)?;
                for _ in 0..n {
                    let k = r.read_utf()?;
                    let v = r.read_object()?;
                    m.borrow_mut().insert((*k).clone(), v);
                }
                Ok(())
            },
        );
        self.register_container::<RefCell<BTreeSet<String>>, _, _>(
            "set.btree",
            |s, w| {
                let s = s.borrow();
                w.write_int(s.len() as i32);
                for v in s.iter() {
                    w.write_utf(v)?;
                }
                Ok(())
            },
            || RefCell::new(BTreeSet::new()),
            |s, r| {
                let n = read_element_count(r)?;
                for _ in 0..n {
                    let v = r.read_utf()?;
                    s.borrow_mut().insert((*v).clone());
                }
                Ok(())
            },
        );
        self.register_container::<RefCell<HashSet<String>>, _, _>(
            "set.hash",
            |s, w| {
                let s = s.borrow();
                w.write_int(s.len() as i32);
                for v in s.iter() {
                    w.write_utf(v)?;
                }
                Ok(())
            },
            || RefCell::new(HashSet::new()),
            |s, r| {
                let n = read_element_count(r)?;
                for _ in 0..n {
                    let v = r.read_utf()?;
                    s.borrow_mut().insert((*v).clone());
                }
                Ok(())
            },
        );
        self.register_container::<RefCell<VecDeque<Option<Obj>>>, _, _>(
            "list",
            |l, w| {
                let l = l.borrow();
                w.write_int(l.len() as i32);
                for v in l.iter() {
                    w.write_object(v.as_ref())?;
                }
                Ok(())
            },
            || RefCell::new(VecDeque::new()),
            |l, r| {
                let n = read_element_count(r)?;
                for _ in 0..n {
                    let v = r.read_object()?;
                    l.borrow_mut().push_back(v);
                }
                Ok(())
            },
        );

        self.register_custom::<Option<Obj>, _, _>(
            "option",
            |v, w| w.write_object(v.as_ref()),
            |r| {
                let idx = r.reserve_slot();
                match r.read_object() {
                    Ok(v) => {
                        let o: Obj = Rc::new(v);
                        r.set_present(idx, o.clone());
                        Ok(o)
                    }
                    Err(e) => {
                        let err = ReadError::wrap("option", e);
                        r.set_failed(idx, err.clone());
                        Err(err)
                    }
                }
            },
        );

        self.register_value::<u8, _, _, _>(
            "u8",
            |v, w| {
                w.raw_out().u8(*v);
                Ok(())
            },
            |r| Ok(r.raw_in().try_u8()?),
            |v| ValueKey::U8(*v),
        );
        self.register_value::<i16, _, _, _>(
            "i16",
            |v, w| {
                w.raw_out().i16(*v);
                Ok(())
            },
            |r| Ok(r.raw_in().try_i16()?),
            |v| ValueKey::I16(*v),
        );
        self.register_value::<i32, _, _, _>(
            "i32",
            |v, w| {
                w.raw_out().var_u32(*v as u32);
                Ok(())
            },
            |r| Ok(r.raw_in().try_var_u32()? as i32),
            |v| ValueKey::I32(*v),
        );
        self.register_value::<i64, _, _, _>(
            "i64",
            |v, w| {
                w.raw_out().i64(*v);
                Ok(())
            },
            |r| Ok(r.raw_in().try_i64()?),
            |v| ValueKey::I64(*v),
        );
        self.register_value::<f32, _, _, _>(
            "f32",
            |v, w| {
                w.raw_out().f32(*v);
                Ok(())
            },
            |r| Ok(r.raw_in().try_f32()?),
            |v| ValueKey::Bits32(v.to_bits()),
        );
        self.register_value::<f64, _, _, _>(
            "f64",
            |v, w| {
                w.raw_out().f64(*v);
                Ok(())
            },
            |r| Ok(r.raw_in().try_f64()?),
            |v| ValueKey::Bits64(v.to_bits()),
        );
        self.register_value::<bool, _, _, _>(
            "bool",
            |v, w| {
                w.raw_out().u8(*v as u8);
                Ok(())
            },
            |r| Ok(r.raw_in().try_u8()? != 0),
            |v| ValueKey::Bool(*v),
        );
        self.register_value::<char, _, _, _>(
            "char",
            |v, w| {
                w.raw_out().u32(*v as u32);
                Ok(())
            },
            |r| {
                let scalar = r.raw_in().try_u32()?;
                char::from_u32(scalar)
                    .ok_or_else(|| ReadError::Protocol(format!("invalid char scalar: {scalar}")))
            },
            |v| ValueKey::Char(*v),
        );
        self.register_value::<Uuid, _, _, _>(
            "uuid",
            |v, w| {
                w.write_raw_utf(&v.to_string());
                Ok(())
            },
            |r| {
                let s = r.read_raw_utf()?;
                Uuid::parse_str(&s)
                    .map_err(|e| ReadError::Message(format!("failed to parse uuid: {e}")))
            },
            |v| ValueKey::Text(v.to_string()),
        );
        self.register_value::<SystemTime, _, _, _>(
            "time",
            |v, w| {
                w.raw_out().i64(epoch_millis(v));
                Ok(())
            },
            |r| Ok(time_from_millis(r.raw_in().try_i64()?)),
            |v| ValueKey::I64(epoch_millis(v)),
        );

        // paths intern their textual form through the tagged UTF path, so
        // the slot is reserved before the payload is read
        self.add_value::<PathBuf>(ValueCodec {
            name: "path".to_owned(),
            write: Box::new(|any, w| {
                let p = any
                    .downcast_ref::<PathBuf>()
                    .ok_or_else(|| WriteError::Protocol("value codec type mismatch: path".into()))?;
                let s = p
                    .to_str()
                    .ok_or_else(|| WriteError::Message("path is not valid unicode".into()))?;
                w.write_utf(s)
            }),
            read: Box::new(|r| {
                let idx = r.reserve_slot();
                match r.read_utf() {
                    Ok(s) => {
                        let o: Obj = Rc::new(PathBuf::from(s.as_str()));
                        r.set_present(idx, o.clone());
                        Ok(o)
                    }
                    Err(e) => {
                        let err = ReadError::wrap("path", e);
                        r.set_failed(idx, err.clone());
                        Err(err)
                    }
                }
            }),
            key: Box::new(|any| {
                any.downcast_ref::<PathBuf>()
                    .map(|p| ValueKey::Text(p.to_string_lossy().into_owned()))
            }),
        });
    }
}

fn external_vtable<T: Externalizable + Default>(
    name: &'static str,
    intern: Option<InternVtable>,
) -> ExternalVtable {
    ExternalVtable {
        create: Box::new(|| Rc::new(T::default()) as Obj),
        write: Box::new(move |any, w| {
            any.downcast_ref::<T>()
                .ok_or_else(|| {
                    WriteError::Protocol(format!("externalizable codec type mismatch: {name}"))
                })?
                .write_content(w)
        }),
        read_content: Box::new(move |o, r| {
            o.downcast_ref::<T>()
                .ok_or_else(|| {
                    ReadError::Protocol(format!("externalizable codec type mismatch: {name}"))
                })?
                .read_content(r)
        }),
        intern,
    }
}

fn read_element_count(r: &mut ContentReader<'_>) -> Result<i32, ReadError> {
    let n = r.read_int()?;
    if n < 0 {
        return Err(ReadError::Protocol(format!("invalid length read: {n}")));
    }
    Ok(n)
}

fn epoch_millis(t: &SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn time_from_millis(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}
