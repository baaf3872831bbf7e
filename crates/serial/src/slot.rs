//! Read-side serialized-object slots.

use std::rc::Rc;

use crate::error::ReadError;
use crate::object::Obj;

/// One entry of the decoder's object table.
///
/// Slot indices mirror the write-side object table exactly; the two must
/// stay in lockstep or the stream is corrupt. A `Failed` slot replays its
/// recorded error on every dereference, an `Unavailable` slot occupies an
/// index whose occupant is not fully known yet.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Present(Obj),
    Failed(ReadError),
    Unavailable,
}

impl Slot {
    pub(crate) fn get(&self) -> Result<Obj, ReadError> {
        match self {
            Slot::Present(o) => Ok(o.clone()),
            Slot::Failed(e) => Err(e.clone()),
            Slot::Unavailable => Err(ReadError::Protocol(
                "serialized object is not yet available".into(),
            )),
        }
    }
}

/// One entry of the decoder's string table. Strings have their own index
/// space, reconstructed purely from the order new strings appear in the
/// stream.
#[derive(Debug, Clone)]
pub(crate) enum StringSlot {
    Present(Rc<String>),
    Failed(ReadError),
}

impl StringSlot {
    pub(crate) fn get(&self) -> Result<Rc<String>, ReadError> {
        match self {
            StringSlot::Present(s) => Ok(s.clone()),
            StringSlot::Failed(e) => Err(e.clone()),
        }
    }
}
