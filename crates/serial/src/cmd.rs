//! Command protocol: the single-byte tags that prefix every field on the wire.
//!
//! Every logical write emits one command byte followed by a payload whose
//! shape is fully determined by the command. Integer and long commands trade
//! payload width for value range, string commands select between full,
//! low-byte, index-reference and prefix-compressed encodings, and object
//! commands identify the kind of the object that follows. Complex object
//! kinds each have an `_ERROR` sibling that the writer patches in when the
//! object's own serialization failed partway through; the payload framing is
//! identical so a reader can still skip the region.
//!
//! Index-reference commands come in four widths. `*_IDX_BASE + n` is the
//! command carrying an `n`-byte big-endian index, for `n` in `1..=4`.

/// Single byte payload.
pub const BYTE: u8 = 1;
/// Single char payload (4-byte Unicode scalar).
pub const CHAR: u8 = 2;

/// 16-bit value whose high byte is zero; 1 payload byte.
pub const SHORT_1: u8 = 3;
/// Full 16-bit value; 2 payload bytes.
pub const SHORT_2: u8 = 4;

/// Int in `0..=0xFF`; 1 payload byte.
pub const INT_1: u8 = 5;
/// Int in `0..=0xFFFF`; 2 payload bytes.
pub const INT_2: u8 = 6;
/// Int in `0..=0xFF_FFFF`; 3 payload bytes.
pub const INT_3: u8 = 7;
/// Full int; 4 payload bytes.
pub const INT_4: u8 = 8;
/// Sign-extended negative int, low byte carried; 1 payload byte.
pub const INT_F_1: u8 = 9;
/// Sign-extended negative int, low 2 bytes carried.
pub const INT_F_2: u8 = 10;
/// Sign-extended negative int, low 3 bytes carried.
pub const INT_F_3: u8 = 11;
/// The int value `0`; no payload.
pub const INT_ZERO: u8 = 12;
/// The int value `-1`; no payload.
pub const INT_NEGATIVE_ONE: u8 = 13;
/// The int value `1`; no payload.
pub const INT_ONE: u8 = 14;

/// Long in `0..=0xFFFF`; 2 payload bytes.
pub const LONG_2: u8 = 15;
/// Long in `0..=0xFFFF_FFFF`; 4 payload bytes.
pub const LONG_4: u8 = 16;
/// Long in `0..=0xFFFF_FFFF_FFFF`; 6 payload bytes.
pub const LONG_6: u8 = 17;
/// Full long; 8 payload bytes.
pub const LONG_8: u8 = 18;
/// Sign-extended negative long, low 2 bytes carried.
pub const LONG_F_2: u8 = 19;
/// Sign-extended negative long, low 4 bytes carried.
pub const LONG_F_4: u8 = 20;
/// Sign-extended negative long, low 6 bytes carried.
pub const LONG_F_6: u8 = 21;
/// The long value `0`; no payload.
pub const LONG_ZERO: u8 = 22;
/// The long value `-1`; no payload.
pub const LONG_NEGATIVE_ONE: u8 = 23;

/// 32-bit float; 4 payload bytes.
pub const FLOAT: u8 = 24;
/// 64-bit float; 8 payload bytes.
pub const DOUBLE: u8 = 25;

/// The boolean `true`; no payload.
pub const BOOLEAN_TRUE: u8 = 26;
/// The boolean `false`; no payload.
pub const BOOLEAN_FALSE: u8 = 27;

/// Full string: varint byte length + UTF-8 bytes.
pub const UTF: u8 = 28;
/// Base for the string index-reference commands.
pub const UTF_IDX_BASE: u8 = UTF;
pub const UTF_IDX_1: u8 = UTF_IDX_BASE + 1;
pub const UTF_IDX_2: u8 = UTF_IDX_BASE + 2;
pub const UTF_IDX_3: u8 = UTF_IDX_BASE + 3;
pub const UTF_IDX_4: u8 = UTF_IDX_BASE + 4;
/// String whose chars all fit one byte: varint char count + 1 byte per char.
pub const UTF_LOWBYTES: u8 = 33;
/// Prefix-compressed string: varint prefix index + varint common char count
/// + varint suffix byte length + UTF-8 suffix bytes.
pub const UTF_PREFIXED: u8 = 34;
/// Prefix-compressed string with a low-byte suffix: the suffix varint counts
/// chars and the payload is 1 byte per char.
pub const UTF_PREFIXED_LOWBYTES: u8 = 35;

/// Bulk byte run: tagged int count + raw bytes.
pub const BYTEARRAY: u8 = 36;
/// Bulk char run: tagged int count + 4 raw bytes per char.
pub const CHARS: u8 = 37;

/// Type-space (classloader) reference: interned UTF resolver id.
pub const OBJECT_CLASSLOADER: u8 = 38;
/// Array object: component type reference + raw 4-byte length + elements.
pub const OBJECT_ARRAY: u8 = 39;
/// Externalizable object with a 1-byte length field.
pub const OBJECT_EXTERNALIZABLE_1: u8 = 40;
/// Externalizable object with a 4-byte length field.
pub const OBJECT_EXTERNALIZABLE_4: u8 = 41;

/// Base for the object index-reference commands.
pub const OBJECT_IDX_BASE: u8 = OBJECT_EXTERNALIZABLE_4;
pub const OBJECT_IDX_1: u8 = OBJECT_IDX_BASE + 1;
pub const OBJECT_IDX_2: u8 = OBJECT_IDX_BASE + 2;
pub const OBJECT_IDX_3: u8 = OBJECT_IDX_BASE + 3;
pub const OBJECT_IDX_4: u8 = OBJECT_IDX_BASE + 4;

/// The null object; no payload.
pub const OBJECT_NULL: u8 = 46;
/// Native-serialization fallback: raw 4-byte length + self-describing region.
pub const OBJECT_SERIALIZABLE: u8 = 47;
/// Type literal: type-space reference + interned UTF type name.
pub const OBJECT_TYPE: u8 = 48;
/// Registered boxed value: interned UTF type name + raw value payload.
pub const OBJECT_VALUE: u8 = 49;
/// Enum constant: declaring type reference + raw variant name.
pub const OBJECT_ENUM: u8 = 50;

pub const OBJECT_ARRAY_ERROR: u8 = 51;
pub const OBJECT_EXTERNALIZABLE_ERROR: u8 = 52;
pub const OBJECT_SERIALIZABLE_ERROR: u8 = 53;

/// Custom registered per-type codec: type reference + raw 4-byte length +
/// command-structured region.
pub const OBJECT_CUSTOM_SERIALIZABLE: u8 = 54;
pub const OBJECT_CUSTOM_SERIALIZABLE_ERROR: u8 = 55;

/// String written through the object path; payloads mirror the plain UTF
/// commands but resolved values participate in object reads.
pub const OBJECT_UTF: u8 = 56;
pub const OBJECT_UTF_IDX_BASE: u8 = OBJECT_UTF;
pub const OBJECT_UTF_IDX_1: u8 = OBJECT_UTF_IDX_BASE + 1;
pub const OBJECT_UTF_IDX_2: u8 = OBJECT_UTF_IDX_BASE + 2;
pub const OBJECT_UTF_IDX_3: u8 = OBJECT_UTF_IDX_BASE + 3;
pub const OBJECT_UTF_IDX_4: u8 = OBJECT_UTF_IDX_BASE + 4;
pub const OBJECT_UTF_LOWBYTES: u8 = 61;
pub const OBJECT_UTF_PREFIXED: u8 = 62;
pub const OBJECT_UTF_PREFIXED_LOWBYTES: u8 = 63;

/// Dynamic proxy object: type-space reference + tagged interface count +
/// interface type references + handler object.
pub const OBJECT_PROXY: u8 = 64;

/// Highest valid command value; anything above is a protocol error.
pub const MAX_COMMAND: u8 = OBJECT_PROXY;

/// Commands an int read accepts.
pub const INT_COMMANDS: &[u8] = &[
    INT_1,
    INT_2,
    INT_3,
    INT_4,
    INT_F_1,
    INT_F_2,
    INT_F_3,
    INT_ZERO,
    INT_NEGATIVE_ONE,
    INT_ONE,
];

/// Commands a long read accepts.
pub const LONG_COMMANDS: &[u8] = &[
    LONG_2,
    LONG_4,
    LONG_6,
    LONG_8,
    LONG_F_2,
    LONG_F_4,
    LONG_F_6,
    LONG_ZERO,
    LONG_NEGATIVE_ONE,
];

/// Commands a short read accepts.
pub const SHORT_COMMANDS: &[u8] = &[SHORT_1, SHORT_2];

/// Commands a boolean read accepts.
pub const BOOLEAN_COMMANDS: &[u8] = &[BOOLEAN_TRUE, BOOLEAN_FALSE];

/// Commands a byte read accepts.
pub const BYTE_COMMANDS: &[u8] = &[BYTE, BYTEARRAY];

/// Commands a char read accepts.
pub const CHAR_COMMANDS: &[u8] = &[CHAR, CHARS];

/// Commands a string read accepts.
pub const UTF_COMMANDS: &[u8] = &[
    UTF,
    UTF_LOWBYTES,
    UTF_IDX_1,
    UTF_IDX_2,
    UTF_IDX_3,
    UTF_IDX_4,
    UTF_PREFIXED,
    UTF_PREFIXED_LOWBYTES,
];

/// Commands an object read accepts.
pub const OBJECT_COMMANDS: &[u8] = &[
    OBJECT_IDX_1,
    OBJECT_IDX_2,
    OBJECT_IDX_3,
    OBJECT_IDX_4,
    OBJECT_ARRAY,
    OBJECT_ARRAY_ERROR,
    OBJECT_CLASSLOADER,
    OBJECT_CUSTOM_SERIALIZABLE,
    OBJECT_CUSTOM_SERIALIZABLE_ERROR,
    OBJECT_ENUM,
    OBJECT_EXTERNALIZABLE_1,
    OBJECT_EXTERNALIZABLE_4,
    OBJECT_EXTERNALIZABLE_ERROR,
    OBJECT_NULL,
    OBJECT_SERIALIZABLE,
    OBJECT_SERIALIZABLE_ERROR,
    OBJECT_TYPE,
    OBJECT_VALUE,
    OBJECT_PROXY,
    OBJECT_UTF,
    OBJECT_UTF_IDX_1,
    OBJECT_UTF_IDX_2,
    OBJECT_UTF_IDX_3,
    OBJECT_UTF_IDX_4,
    OBJECT_UTF_LOWBYTES,
    OBJECT_UTF_PREFIXED,
    OBJECT_UTF_PREFIXED_LOWBYTES,
];

/// Commands a type-reference read accepts.
pub const TYPE_COMMANDS: &[u8] = &[
    OBJECT_TYPE,
    OBJECT_IDX_1,
    OBJECT_IDX_2,
    OBJECT_IDX_3,
    OBJECT_IDX_4,
];

/// Human-readable family of a command, for diagnostics in type mismatch
/// errors.
pub fn command_type_info(c: u8) -> &'static str {
    match c {
        BYTE | BYTEARRAY => "byte",
        CHAR | CHARS => "char",
        SHORT_1 | SHORT_2 => "short",
        INT_1 | INT_2 | INT_3 | INT_4 | INT_F_1 | INT_F_2 | INT_F_3 | INT_ZERO
        | INT_NEGATIVE_ONE | INT_ONE => "int",
        LONG_2 | LONG_4 | LONG_6 | LONG_8 | LONG_F_2 | LONG_F_4 | LONG_F_6 | LONG_ZERO
        | LONG_NEGATIVE_ONE => "long",
        FLOAT => "float",
        DOUBLE => "double",
        BOOLEAN_TRUE | BOOLEAN_FALSE => "boolean",
        UTF | UTF_IDX_1 | UTF_IDX_2 | UTF_IDX_3 | UTF_IDX_4 | UTF_LOWBYTES | UTF_PREFIXED
        | UTF_PREFIXED_LOWBYTES => "UTF",
        OBJECT_IDX_1 | OBJECT_IDX_2 | OBJECT_IDX_3 | OBJECT_IDX_4 | OBJECT_VALUE
        | OBJECT_CUSTOM_SERIALIZABLE | OBJECT_CUSTOM_SERIALIZABLE_ERROR => "object",
        OBJECT_UTF | OBJECT_UTF_IDX_1 | OBJECT_UTF_IDX_2 | OBJECT_UTF_IDX_3 | OBJECT_UTF_IDX_4
        | OBJECT_UTF_LOWBYTES | OBJECT_UTF_PREFIXED | OBJECT_UTF_PREFIXED_LOWBYTES => {
            "object (String)"
        }
        OBJECT_ARRAY | OBJECT_ARRAY_ERROR => "object (array)",
        OBJECT_EXTERNALIZABLE_1 | OBJECT_EXTERNALIZABLE_4 | OBJECT_EXTERNALIZABLE_ERROR => {
            "object (Externalizable)"
        }
        OBJECT_NULL => "object (null)",
        OBJECT_SERIALIZABLE | OBJECT_SERIALIZABLE_ERROR => "object (Serializable)",
        OBJECT_TYPE => "object (type)",
        OBJECT_ENUM => "object (enum)",
        OBJECT_CLASSLOADER => "object (type space)",
        OBJECT_PROXY => "object (proxy)",
        _ => "<unknown>",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_values_are_contiguous() {
        // the tag space must stay dense: a value of 0 or above MAX_COMMAND is
        // how the reader detects stream corruption
        assert_eq!(UTF_IDX_4, 32);
        assert_eq!(OBJECT_IDX_4, 45);
        assert_eq!(OBJECT_UTF_IDX_4, 60);
        assert_eq!(MAX_COMMAND, 64);
    }

    #[test]
    fn every_command_has_type_info() {
        for c in 1..=MAX_COMMAND {
            assert_ne!(command_type_info(c), "<unknown>", "command {c}");
        }
        assert_eq!(command_type_info(0), "<unknown>");
        assert_eq!(command_type_info(MAX_COMMAND + 1), "<unknown>");
    }
}
