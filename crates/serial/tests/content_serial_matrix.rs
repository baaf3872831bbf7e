//! End-to-end matrix for the content serialization protocol: round-trips,
//! dedup behavior, fault containment, and the adaptive integer encodings.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskwire_serial::{
    obj, CodecRegistry, ContentReader, ContentWriter, DefaultSpaceResolver, Externalizable, Obj,
    ProxyObject, ReadError, SpaceHandle, TypeHandle, WriteError,
};

/// A task result record in the style the build engine persists: a name, an
/// attempt counter, and an arbitrary follow-up reference (possibly cyclic).
#[derive(Default)]
struct TaskRecord {
    name: RefCell<String>,
    attempts: Cell<i32>,
    next: RefCell<Option<Obj>>,
}

impl Externalizable for TaskRecord {
    fn write_content(&self, out: &mut ContentWriter) -> Result<(), WriteError> {
        out.write_utf(&self.name.borrow())?;
        out.write_int(self.attempts.get());
        out.write_object(self.next.borrow().as_ref())
    }

    fn read_content(&self, input: &mut ContentReader<'_>) -> Result<(), ReadError> {
        *self.name.borrow_mut() = (*input.read_utf()?).clone();
        self.attempts.set(input.read_int()?);
        *self.next.borrow_mut() = input.read_object()?;
        Ok(())
    }
}

/// An externalizable value type: equal hashes collapse on the wire.
#[derive(Default, Clone)]
struct ContentHash {
    hi: Cell<u64>,
    lo: Cell<u64>,
}

impl ContentHash {
    fn of(hi: u64, lo: u64) -> Self {
        Self {
            hi: Cell::new(hi),
            lo: Cell::new(lo),
        }
    }
}

impl PartialEq for ContentHash {
    fn eq(&self, other: &Self) -> bool {
        self.hi.get() == other.hi.get() && self.lo.get() == other.lo.get()
    }
}

impl Eq for ContentHash {}

impl Hash for ContentHash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hi.get().hash(state);
        self.lo.get().hash(state);
    }
}

impl Externalizable for ContentHash {
    fn write_content(&self, out: &mut ContentWriter) -> Result<(), WriteError> {
        out.write_long(self.hi.get() as i64);
        out.write_long(self.lo.get() as i64);
        Ok(())
    }

    fn read_content(&self, input: &mut ContentReader<'_>) -> Result<(), ReadError> {
        self.hi.set(input.read_long()? as u64);
        self.lo.set(input.read_long()? as u64);
        Ok(())
    }
}

/// Writes two values but only reads one back; exercises the non-exhaustive
/// region warning path.
#[derive(Default)]
struct SloppyRecord {
    first: Cell<i32>,
}

impl Externalizable for SloppyRecord {
    fn write_content(&self, out: &mut ContentWriter) -> Result<(), WriteError> {
        out.write_int(self.first.get());
        out.write_int(9999);
        Ok(())
    }

    fn read_content(&self, input: &mut ContentReader<'_>) -> Result<(), ReadError> {
        self.first.set(input.read_int()?);
        Ok(())
    }
}

/// Fails partway through its own serialization.
#[derive(Default)]
struct ExplodingRecord;

impl Externalizable for ExplodingRecord {
    fn write_content(&self, out: &mut ContentWriter) -> Result<(), WriteError> {
        out.write_int(1);
        Err(WriteError::Message("record cannot be persisted".into()))
    }

    fn read_content(&self, input: &mut ContentReader<'_>) -> Result<(), ReadError> {
        input.read_int()?;
        Ok(())
    }
}

/// Serializes fine, always fails to reconstruct.
struct BrittleRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Running,
    Done,
}

fn task_state_name(s: &TaskState) -> &'static str {
    match s {
        TaskState::Pending => "Pending",
        TaskState::Running => "Running",
        TaskState::Done => "Done",
    }
}

fn task_state_from(name: &str) -> Option<TaskState> {
    match name {
        "Pending" => Some(TaskState::Pending),
        "Running" => Some(TaskState::Running),
        "Done" => Some(TaskState::Done),
        _ => None,
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct LegacyMeta {
    version: u32,
    label: String,
}

fn test_registry() -> Arc<CodecRegistry> {
    let mut r = CodecRegistry::with_defaults();
    r.register_external::<TaskRecord>("TaskRecord");
    r.register_external::<SloppyRecord>("SloppyRecord");
    r.register_external::<ExplodingRecord>("ExplodingRecord");
    r.register_external_value::<ContentHash>("ContentHash");
    r.register_enum::<TaskState>("TaskState", task_state_name, task_state_from);
    r.register_native::<LegacyMeta>("LegacyMeta");
    r.register_custom::<BrittleRecord, _, _>(
        "BrittleRecord",
        |_, w| {
            w.write_int(7);
            Ok(())
        },
        |r| {
            let _ = r.read_int();
            let err = ReadError::Message("brittle record refused to load".into());
            r.add_failed(err.clone());
            Err(err)
        },
    );
    Arc::new(r)
}

fn roundtrip(write: impl FnOnce(&mut ContentWriter)) -> (Arc<CodecRegistry>, Vec<u8>) {
    let registry = test_registry();
    let mut w = ContentWriter::new(registry.clone());
    write(&mut w);
    let bytes = w.drain_to_bytes();
    (registry, bytes)
}

const INT_CASES: &[i32] = &[
    0,
    1,
    2,
    -1,
    -10,
    0xFF,
    0xFFFF,
    0xFF_FFFF,
    -0x100,
    -0x1_0000,
    -0x100_0000,
    0x1234_5678,
    -0x1234_5678,
    i32::MIN,
    i32::MAX,
];

const LONG_CASES: &[i64] = &[
    0,
    1,
    2,
    -1,
    -10,
    0xFF,
    0xFFFF,
    0xFF_FFFF,
    0xFFFF_FFFF,
    0xFF_FFFF_FFFF,
    0xFFFF_FFFF_FFFF,
    0xFF_FFFF_FFFF_FFFF,
    -0x100,
    -0x1_0000,
    -0x1_0000_0000,
    -0x1_0000_0000_0000,
    0x7654_3210_fedc_ba98,
    -0x7654_3210_fedc_ba98,
    i64::MIN,
    i64::MAX,
];

#[test]
fn primitive_roundtrip_matrix() {
    let shorts: &[i16] = &[0, 1, 2, -1, -10, 0xFF, -0x100, i16::MIN, i16::MAX];
    let floats: &[f32] = &[
        -1234.0,
        -1.0,
        -0.0,
        0.0,
        1.0,
        f32::MIN_POSITIVE,
        f32::MAX,
        f32::NEG_INFINITY,
        f32::INFINITY,
    ];
    let doubles: &[f64] = &[
        -1234.0,
        -1.0,
        -0.0,
        0.0,
        1.0,
        f64::MIN_POSITIVE,
        f64::MAX,
        f64::NEG_INFINITY,
        f64::INFINITY,
    ];
    let chars: &[char] = &['\0', 'a', 'é', '\u{1234}', '\u{10FFFF}'];

    let (registry, bytes) = roundtrip(|w| {
        for &v in INT_CASES {
            w.write_int(v);
        }
        for &v in LONG_CASES {
            w.write_long(v);
        }
        for &v in shorts {
            w.write_short(v);
        }
        for &v in floats {
            w.write_float(v);
        }
        for &v in doubles {
            w.write_double(v);
        }
        for &v in chars {
            w.write_char(v);
        }
        w.write_boolean(true);
        w.write_boolean(false);
        w.write_byte(0xab);
        w.write_bytes(&[0, 1, 254, 255]);
    });
    let mut r = ContentReader::new(registry, &bytes);
    for &v in INT_CASES {
        assert_eq!(r.read_int().unwrap(), v, "int {v}");
    }
    for &v in LONG_CASES {
        assert_eq!(r.read_long().unwrap(), v, "long {v}");
    }
    for &v in shorts {
        assert_eq!(r.read_short().unwrap(), v, "short {v}");
    }
    for &v in floats {
        assert_eq!(r.read_float().unwrap(), v, "float {v}");
    }
    for &v in doubles {
        assert_eq!(r.read_double().unwrap(), v, "double {v}");
    }
    for &v in chars {
        assert_eq!(r.read_char().unwrap(), v, "char {v:?}");
    }
    assert!(r.read_boolean().unwrap());
    assert!(!r.read_boolean().unwrap());
    assert_eq!(r.read_byte().unwrap(), 0xab);
    let mut buf = [0u8; 4];
    r.read_fully(&mut buf).unwrap();
    assert_eq!(buf, [0, 1, 254, 255]);
}

#[test]
fn nan_floats_roundtrip_by_bits() {
    let (registry, bytes) = roundtrip(|w| {
        w.write_float(f32::NAN);
        w.write_double(f64::NAN);
    });
    let mut r = ContentReader::new(registry, &bytes);
    assert!(r.read_float().unwrap().is_nan());
    assert!(r.read_double().unwrap().is_nan());
}

#[test]
fn string_prefix_compression_is_lossless_and_smaller() {
    let first = "com.example.project.tasks.CompileTask";
    let second = "com.example.project.tasks.ArchiveTask";
    let unrelated = "zzz.unrelated.Übername";

    // draining between writes isolates each string's encoding while the
    // intern tables persist across the session
    let registry = test_registry();
    let mut w = ContentWriter::new(registry.clone());
    w.write_utf(first).unwrap();
    let mut stream = w.drain_to_bytes();
    w.write_utf(second).unwrap();
    let second_encoding = w.drain_to_bytes();
    w.write_utf(unrelated).unwrap();
    w.write_utf(first).unwrap();
    w.write_utf(unrelated).unwrap();
    stream.extend_from_slice(&second_encoding);
    stream.extend_from_slice(&w.drain_to_bytes());

    let standalone = {
        let mut w = ContentWriter::new(test_registry());
        w.write_utf(second).unwrap();
        w.drain_to_bytes().len()
    };
    assert!(
        second_encoding.len() < standalone,
        "prefix compression had no effect: {} vs {}",
        second_encoding.len(),
        standalone
    );

    let mut r = ContentReader::new(registry, &stream);
    let a = r.read_utf().unwrap();
    assert_eq!(&**a, first);
    assert_eq!(&**r.read_utf().unwrap(), second);
    assert_eq!(&**r.read_utf().unwrap(), unrelated);
    let a2 = r.read_utf().unwrap();
    assert_eq!(&**a2, first);
    // index reference resolves to the very same instance
    assert!(Rc::ptr_eq(&a, &a2));
    assert_eq!(&**r.read_utf().unwrap(), unrelated);
}

#[test]
fn identity_dedup_reproduces_reference_identity() {
    let shared = obj(vec![1i64, 2, 3]);
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&shared)).unwrap();
        w.write_object(Some(&shared)).unwrap();
    });
    let mut r = ContentReader::new(registry, &bytes);
    let a = r.read_object().unwrap().unwrap();
    let b = r.read_object().unwrap().unwrap();
    assert!(Rc::ptr_eq(&a, &b));
    assert_eq!(a.downcast_ref::<Vec<i64>>().unwrap(), &vec![1i64, 2, 3]);
}

#[test]
fn equal_boxed_values_intern_to_one_occurrence() {
    let a = obj(0x1234_5678_9abci64);
    let b = obj(0x1234_5678_9abci64);
    assert!(!Rc::ptr_eq(&a, &b));
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&a)).unwrap();
        w.write_object(Some(&b)).unwrap();
    });
    let mut r = ContentReader::new(registry, &bytes);
    let x = r.read_object().unwrap().unwrap();
    let y = r.read_object().unwrap().unwrap();
    // distinct instances on the write side, one instance on the read side
    assert!(Rc::ptr_eq(&x, &y));
    assert_eq!(*x.downcast_ref::<i64>().unwrap(), 0x1234_5678_9abc);
}

#[test]
fn boxed_value_matrix_roundtrip() {
    let uuid = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
    let time = UNIX_EPOCH + Duration::from_millis(1_700_000_123_456);
    let path = PathBuf::from("build/out/tasks/compile.log");
    let values: Vec<Obj> = vec![
        obj(42u8),
        obj(-1234i16),
        obj(77_000i32),
        obj(-5i64),
        obj(1.5f32),
        obj(std::f64::consts::E),
        obj(true),
        obj('λ'),
        obj(uuid),
        obj(time),
        obj(path.clone()),
    ];
    let (registry, bytes) = roundtrip(|w| {
        for v in &values {
            w.write_object(Some(v)).unwrap();
        }
    });
    let mut r = ContentReader::new(registry, &bytes);
    assert_eq!(*r.read_object().unwrap().unwrap().downcast_ref::<u8>().unwrap(), 42);
    assert_eq!(*r.read_object().unwrap().unwrap().downcast_ref::<i16>().unwrap(), -1234);
    assert_eq!(*r.read_object().unwrap().unwrap().downcast_ref::<i32>().unwrap(), 77_000);
    assert_eq!(*r.read_object().unwrap().unwrap().downcast_ref::<i64>().unwrap(), -5);
    assert_eq!(*r.read_object().unwrap().unwrap().downcast_ref::<f32>().unwrap(), 1.5);
    assert_eq!(
        *r.read_object().unwrap().unwrap().downcast_ref::<f64>().unwrap(),
        std::f64::consts::E
    );
    assert!(*r.read_object().unwrap().unwrap().downcast_ref::<bool>().unwrap());
    assert_eq!(*r.read_object().unwrap().unwrap().downcast_ref::<char>().unwrap(), 'λ');
    assert_eq!(*r.read_object().unwrap().unwrap().downcast_ref::<Uuid>().unwrap(), uuid);
    assert_eq!(
        *r.read_object().unwrap().unwrap().downcast_ref::<std::time::SystemTime>().unwrap(),
        time
    );
    assert_eq!(
        *r.read_object().unwrap().unwrap().downcast_ref::<PathBuf>().unwrap(),
        path
    );
}

#[test]
fn array_matrix_roundtrip() {
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&obj(vec![1u8, 2, 3]))).unwrap();
        w.write_object(Some(&obj(vec![1i16, -2, 3]))).unwrap();
        w.write_object(Some(&obj(vec![1i32, -70000, 3]))).unwrap();
        w.write_object(Some(&obj(vec![1i64, i64::MIN, 3]))).unwrap();
        w.write_object(Some(&obj(vec![1.0f32, -2.5]))).unwrap();
        w.write_object(Some(&obj(vec![1.0f64, -2.5]))).unwrap();
        w.write_object(Some(&obj(vec![true, false]))).unwrap();
        w.write_object(Some(&obj(vec!['a', 'ß', '\u{1F600}']))).unwrap();
        let mixed: Vec<Option<Obj>> = vec![
            Some(obj("first".to_owned())),
            None,
            Some(obj(123i32)),
        ];
        w.write_object(Some(&obj(RefCell::new(mixed)))).unwrap();
    });
    let mut r = ContentReader::new(registry, &bytes);
    assert_eq!(
        r.read_object().unwrap().unwrap().downcast_ref::<Vec<u8>>().unwrap(),
        &vec![1u8, 2, 3]
    );
    assert_eq!(
        r.read_object().unwrap().unwrap().downcast_ref::<Vec<i16>>().unwrap(),
        &vec![1i16, -2, 3]
    );
    assert_eq!(
        r.read_object().unwrap().unwrap().downcast_ref::<Vec<i32>>().unwrap(),
        &vec![1i32, -70000, 3]
    );
    assert_eq!(
        r.read_object().unwrap().unwrap().downcast_ref::<Vec<i64>>().unwrap(),
        &vec![1i64, i64::MIN, 3]
    );
    assert_eq!(
        r.read_object().unwrap().unwrap().downcast_ref::<Vec<f32>>().unwrap(),
        &vec![1.0f32, -2.5]
    );
    assert_eq!(
        r.read_object().unwrap().unwrap().downcast_ref::<Vec<f64>>().unwrap(),
        &vec![1.0f64, -2.5]
    );
    assert_eq!(
        r.read_object().unwrap().unwrap().downcast_ref::<Vec<bool>>().unwrap(),
        &vec![true, false]
    );
    assert_eq!(
        r.read_object().unwrap().unwrap().downcast_ref::<Vec<char>>().unwrap(),
        &vec!['a', 'ß', '\u{1F600}']
    );
    let mixed = r.read_object().unwrap().unwrap();
    let mixed = mixed
        .downcast_ref::<RefCell<Vec<Option<Obj>>>>()
        .unwrap()
        .borrow();
    assert_eq!(mixed.len(), 3);
    assert_eq!(
        mixed[0].as_ref().unwrap().downcast_ref::<String>().unwrap(),
        "first"
    );
    assert!(mixed[1].is_none());
    assert_eq!(*mixed[2].as_ref().unwrap().downcast_ref::<i32>().unwrap(), 123);
}

#[test]
fn container_matrix_roundtrip() {
    let (registry, bytes) = roundtrip(|w| {
        let mut map = BTreeMap::new();
        map.insert("limit".to_owned(), Some(obj(10i32)));
        map.insert("name".to_owned(), Some(obj("compile".to_owned())));
        map.insert("missing".to_owned(), None);
        w.write_object(Some(&obj(RefCell::new(map)))).unwrap();

        let mut set = BTreeSet::new();
        set.insert("a.txt".to_owned());
        set.insert("b.txt".to_owned());
        w.write_object(Some(&obj(RefCell::new(set)))).unwrap();

        let mut list = VecDeque::new();
        list.push_back(Some(obj(1i32)));
        list.push_back(None);
        w.write_object(Some(&obj(RefCell::new(list)))).unwrap();

        w.write_object(Some(&obj(Some(obj("present".to_owned())))))
            .unwrap();
        w.write_object(Some(&obj(None::<Obj>))).unwrap();
    });
    let mut r = ContentReader::new(registry, &bytes);

    let map = r.read_object().unwrap().unwrap();
    let map = map
        .downcast_ref::<RefCell<BTreeMap<String, Option<Obj>>>>()
        .unwrap()
        .borrow();
    assert_eq!(map.len(), 3);
    assert_eq!(
        *map["limit"].as_ref().unwrap().downcast_ref::<i32>().unwrap(),
        10
    );
    assert_eq!(
        map["name"].as_ref().unwrap().downcast_ref::<String>().unwrap(),
        "compile"
    );
    assert!(map["missing"].is_none());

    let set = r.read_object().unwrap().unwrap();
    let set = set
        .downcast_ref::<RefCell<BTreeSet<String>>>()
        .unwrap()
        .borrow();
    assert!(set.contains("a.txt") && set.contains("b.txt"));

    let list = r.read_object().unwrap().unwrap();
    let list = list
        .downcast_ref::<RefCell<VecDeque<Option<Obj>>>>()
        .unwrap()
        .borrow();
    assert_eq!(list.len(), 2);
    assert!(list[1].is_none());

    let some = r.read_object().unwrap().unwrap();
    let some = some.downcast_ref::<Option<Obj>>().unwrap();
    assert_eq!(
        some.as_ref().unwrap().downcast_ref::<String>().unwrap(),
        "present"
    );
    let none = r.read_object().unwrap().unwrap();
    assert!(none.downcast_ref::<Option<Obj>>().unwrap().is_none());
}

#[test]
fn enum_roundtrip_and_identity() {
    let running = obj(TaskState::Running);
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&running)).unwrap();
        w.write_object(Some(&obj(TaskState::Done))).unwrap();
        w.write_object(Some(&running)).unwrap();
    });
    let mut r = ContentReader::new(registry, &bytes);
    let a = r.read_object().unwrap().unwrap();
    assert_eq!(*a.downcast_ref::<TaskState>().unwrap(), TaskState::Running);
    let b = r.read_object().unwrap().unwrap();
    assert_eq!(*b.downcast_ref::<TaskState>().unwrap(), TaskState::Done);
    let a2 = r.read_object().unwrap().unwrap();
    assert!(Rc::ptr_eq(&a, &a2));
}

#[test]
fn externalizable_roundtrip() {
    let rec = obj(TaskRecord::default());
    {
        let t = rec.downcast_ref::<TaskRecord>().unwrap();
        *t.name.borrow_mut() = "compile:app".to_owned();
        t.attempts.set(3);
    }
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&rec)).unwrap();
        w.write_int(77);
    });
    let mut r = ContentReader::new(registry, &bytes);
    let got = r.read_object().unwrap().unwrap();
    let t = got.downcast_ref::<TaskRecord>().unwrap();
    assert_eq!(&*t.name.borrow(), "compile:app");
    assert_eq!(t.attempts.get(), 3);
    assert!(t.next.borrow().is_none());
    assert_eq!(r.read_int().unwrap(), 77);
}

#[test]
fn cyclic_graph_reproduces_the_cycle() {
    let rec = obj(TaskRecord::default());
    {
        let t = rec.downcast_ref::<TaskRecord>().unwrap();
        *t.name.borrow_mut() = "self-referential".to_owned();
        *t.next.borrow_mut() = Some(rec.clone());
    }
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&rec)).unwrap();
    });
    let mut r = ContentReader::new(registry, &bytes);
    let got = r.read_object().unwrap().unwrap();
    let t = got.downcast_ref::<TaskRecord>().unwrap();
    let next = t.next.borrow().clone().unwrap();
    assert!(Rc::ptr_eq(&next, &got));
}

#[test]
fn two_node_cycle_reproduces_both_edges() {
    let a = obj(TaskRecord::default());
    let b = obj(TaskRecord::default());
    a.downcast_ref::<TaskRecord>().unwrap().next.replace(Some(b.clone()));
    b.downcast_ref::<TaskRecord>().unwrap().next.replace(Some(a.clone()));
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&a)).unwrap();
    });
    let mut r = ContentReader::new(registry, &bytes);
    let got_a = r.read_object().unwrap().unwrap();
    let got_b = got_a
        .downcast_ref::<TaskRecord>()
        .unwrap()
        .next
        .borrow()
        .clone()
        .unwrap();
    let back = got_b
        .downcast_ref::<TaskRecord>()
        .unwrap()
        .next
        .borrow()
        .clone()
        .unwrap();
    assert!(Rc::ptr_eq(&back, &got_a));
}

#[test]
fn externalizable_value_type_interns_by_equality() {
    let a = obj(ContentHash::of(0xdead_beef, 0xcafe));
    let b = obj(ContentHash::of(0xdead_beef, 0xcafe));
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&a)).unwrap();
        w.write_object(Some(&b)).unwrap();
    });
    let mut r = ContentReader::new(registry, &bytes);
    let x = r.read_object().unwrap().unwrap();
    let y = r.read_object().unwrap().unwrap();
    assert!(Rc::ptr_eq(&x, &y));
    assert_eq!(x.downcast_ref::<ContentHash>().unwrap().hi.get(), 0xdead_beef);
}

#[test]
fn native_fallback_roundtrip() {
    let meta = obj(LegacyMeta {
        version: 4,
        label: "pre-rewrite metadata".to_owned(),
    });
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&meta)).unwrap();
        w.write_boolean(true);
    });
    let mut r = ContentReader::new(registry, &bytes);
    let got = r.read_object().unwrap().unwrap();
    assert_eq!(
        got.downcast_ref::<LegacyMeta>().unwrap(),
        &LegacyMeta {
            version: 4,
            label: "pre-rewrite metadata".to_owned(),
        }
    );
    assert!(r.read_boolean().unwrap());
}

#[test]
fn failed_read_is_contained_to_its_slot() {
    let brittle = obj(BrittleRecord);
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&brittle)).unwrap();
        w.write_object(Some(&obj(555i32))).unwrap();
        // a second reference to the brittle object
        w.write_object(Some(&brittle)).unwrap();
        w.write_utf("epilogue").unwrap();
    });
    let mut r = ContentReader::new(registry, &bytes);
    // the brittle object fails on its own
    assert!(r.read_object().is_err());
    // ...but the following object decodes correctly and independently
    let c = r.read_object().unwrap().unwrap();
    assert_eq!(*c.downcast_ref::<i32>().unwrap(), 555);
    // dereferencing the failed slot raises the recorded error
    assert!(matches!(r.read_object(), Err(ReadError::Message(_))));
    assert_eq!(&**r.read_utf().unwrap(), "epilogue");
}

#[test]
fn write_failure_patches_the_stream_and_decode_continues() {
    let registry = test_registry();
    let mut w = ContentWriter::new(registry.clone());
    let exploding = obj(ExplodingRecord);
    let err = w.write_object(Some(&exploding));
    assert!(matches!(err, Err(WriteError::ObjectWrite { .. })));
    // the caller decides to keep the record going
    w.write_object(Some(&obj(808i32))).unwrap();
    let bytes = w.drain_to_bytes();

    let mut r = ContentReader::new(registry, &bytes);
    // the failed object deterministically yields a writer-side failure
    assert!(matches!(r.read_object(), Err(ReadError::ObjectWrite(_))));
    let after = r.read_object().unwrap().unwrap();
    assert_eq!(*after.downcast_ref::<i32>().unwrap(), 808);
}

#[test]
fn partially_consumed_region_still_yields_the_object() {
    let sloppy = obj(SloppyRecord::default());
    sloppy.downcast_ref::<SloppyRecord>().unwrap().first.set(41);
    let (registry, bytes) = roundtrip(|w| {
        w.write_object(Some(&sloppy)).unwrap();
        w.write_int(42);
    });
    let mut r = ContentReader::new(registry, &bytes);
    let got = r.read_object().unwrap().unwrap();
    assert_eq!(got.downcast_ref::<SloppyRecord>().unwrap().first.get(), 41);
    // the unread tail of the region must not leak into the parent stream
    assert_eq!(r.read_int().unwrap(), 42);
}

#[test]
fn proxy_roundtrip() {
    let registry = test_registry();
    let handler = obj(TaskRecord::default());
    *handler
        .downcast_ref::<TaskRecord>()
        .unwrap()
        .name
        .borrow_mut() = "delegate".to_owned();
    let iface = TypeHandle(registry.type_by_name("map.btree").unwrap());
    let proxy = obj(ProxyObject {
        space: None,
        interfaces: vec![iface],
        handler,
    });
    let mut w = ContentWriter::new(registry.clone());
    w.write_object(Some(&proxy)).unwrap();
    let bytes = w.drain_to_bytes();

    let mut r = ContentReader::new(registry, &bytes);
    let got = r.read_object().unwrap().unwrap();
    let p = got.downcast_ref::<ProxyObject>().unwrap();
    assert_eq!(p.interfaces.len(), 1);
    assert_eq!(p.interfaces[0].name(), "map.btree");
    let h = p.handler.downcast_ref::<TaskRecord>().unwrap();
    assert_eq!(&*h.name.borrow(), "delegate");
}

#[test]
fn named_type_space_resolves_through_the_resolver() {
    let registry = test_registry();
    let plugin = Arc::new(CodecRegistry::with_defaults());
    let mut resolver = DefaultSpaceResolver::new(registry.clone());
    resolver.register("plugin", plugin.clone());
    let resolver = Arc::new(resolver);

    let mut w = ContentWriter::with_resolver(registry.clone(), resolver.clone());
    let space = obj(SpaceHandle(plugin.clone()));
    w.write_object(Some(&space)).unwrap();
    let bytes = w.drain_to_bytes();

    let mut r = ContentReader::with_resolver(registry, resolver, &bytes);
    let got = r.read_object().unwrap().unwrap();
    let got = got.downcast_ref::<SpaceHandle>().unwrap();
    assert!(Arc::ptr_eq(&got.0, &plugin));
}

#[test]
fn type_literals_roundtrip_with_identity() {
    let registry = test_registry();
    let handle = obj(TypeHandle(registry.type_by_name("TaskState").unwrap()));
    let mut w = ContentWriter::new(registry.clone());
    w.write_object(Some(&handle)).unwrap();
    w.write_object(Some(&handle)).unwrap();
    let bytes = w.drain_to_bytes();
    let mut r = ContentReader::new(registry, &bytes);
    let a = r.read_object().unwrap().unwrap();
    let b = r.read_object().unwrap().unwrap();
    assert!(Rc::ptr_eq(&a, &b));
    assert_eq!(a.downcast_ref::<TypeHandle>().unwrap().name(), "TaskState");
}

#[test]
fn interleaved_bulk_bytes_and_objects() {
    let (registry, bytes) = roundtrip(|w| {
        w.write_bytes(b"payload");
        w.write_object(Some(&obj(7i32))).unwrap();
        w.write_bytes(b"more");
    });
    let mut r = ContentReader::new(registry, &bytes);
    let mut buf = [0u8; 7];
    r.read_fully(&mut buf).unwrap();
    assert_eq!(&buf, b"payload");
    let v = r.read_object().unwrap().unwrap();
    assert_eq!(*v.downcast_ref::<i32>().unwrap(), 7);
    let mut buf = [0u8; 4];
    r.read_fully(&mut buf).unwrap();
    assert_eq!(&buf, b"more");
}

proptest! {
    #[test]
    fn adaptive_int_encoding_is_exact(values in proptest::collection::vec(any::<i32>(), 1..64)) {
        let registry = test_registry();
        let mut w = ContentWriter::new(registry.clone());
        for &v in &values {
            w.write_int(v);
        }
        let bytes = w.drain_to_bytes();
        let mut r = ContentReader::new(registry, &bytes);
        for &v in &values {
            prop_assert_eq!(r.read_int().unwrap(), v);
        }
    }

    #[test]
    fn adaptive_long_encoding_is_exact(values in proptest::collection::vec(any::<i64>(), 1..64)) {
        let registry = test_registry();
        let mut w = ContentWriter::new(registry.clone());
        for &v in &values {
            w.write_long(v);
        }
        let bytes = w.drain_to_bytes();
        let mut r = ContentReader::new(registry, &bytes);
        for &v in &values {
            prop_assert_eq!(r.read_long().unwrap(), v);
        }
    }

    #[test]
    fn utf_roundtrip_with_interning(strings in proptest::collection::vec("[a-zA-Z0-9/._\u{e9}\u{1F600}-]{0,40}", 1..32)) {
        let registry = test_registry();
        let mut w = ContentWriter::new(registry.clone());
        for s in &strings {
            w.write_utf(s).unwrap();
        }
        let bytes = w.drain_to_bytes();
        let mut r = ContentReader::new(registry, &bytes);
        for s in &strings {
            prop_assert_eq!(&**r.read_utf().unwrap(), s.as_str());
        }
    }
}
