//! # Layout
//!
//! Explicit schema descriptors and the size resolver.
//!
//! Every type that can travel on the wire describes itself as a [`Layout`].
//! The size of a layout is a pure function of its shape and the [`Limits`]
//! in force for the field it occupies, so both ends of a connection can agree
//! on the number of bytes a packet body takes without any length on the wire.
//!
//! ```text
//! bool                 1
//! u8 i8                1
//! u16 i16              2
//! u32 i32 f32 char     4
//! u64 i64 f64          8
//! text                 4 + max_string
//! sequence<E>          4 + size(E) * max_indices
//! map<K, V>            4 + (size(K) + size(V)) * max_indices
//! composite            sum(size(field))
//! ```

use crate::config::{LENGTH_PREFIX_SIZE, MAX_ARRAY_INDICES, STANDARD_STRING_SIZE};
use crate::error::{constants, ProtocolError, Result};
use std::fmt;

/// Bounds applied to variable-length fields.
///
/// A field override sets both bounds to the same value. Element, key and value
/// types of a sequence or map always use the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum UTF-8 byte length of text
    pub max_string: usize,
    /// Maximum number of sequence elements or map entries
    pub max_indices: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_string: STANDARD_STRING_SIZE,
            max_indices: MAX_ARRAY_INDICES,
        }
    }
}

impl Limits {
    /// Limits for a field carrying an optional `max_length` override.
    pub fn from_override(max_length: Option<usize>) -> Self {
        match max_length {
            Some(max) => Self {
                max_string: max,
                max_indices: max,
            },
            None => Self::default(),
        }
    }
}

/// Fixed-width scalar kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Char,
}

impl ScalarKind {
    /// Natural byte width
    pub const fn width(self) -> usize {
        match self {
            ScalarKind::Bool | ScalarKind::U8 | ScalarKind::I8 => 1,
            ScalarKind::U16 | ScalarKind::I16 => 2,
            ScalarKind::U32 | ScalarKind::I32 | ScalarKind::F32 | ScalarKind::Char => 4,
            ScalarKind::U64 | ScalarKind::I64 | ScalarKind::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::U8 => "u8",
            ScalarKind::I8 => "i8",
            ScalarKind::U16 => "u16",
            ScalarKind::I16 => "i16",
            ScalarKind::U32 => "u32",
            ScalarKind::I32 => "i32",
            ScalarKind::U64 => "u64",
            ScalarKind::I64 => "i64",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
            ScalarKind::Char => "char",
        }
    }
}

/// A named member of a composite layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub layout: Layout,
    /// Overrides both text and sequence bounds for this field only
    pub max_length: Option<usize>,
}

impl Field {
    pub fn new(name: &'static str, layout: Layout, max_length: Option<usize>) -> Self {
        Self {
            name,
            layout,
            max_length,
        }
    }

    /// Byte size of this field under its own override.
    pub fn size(&self) -> Result<usize> {
        self.layout.size(Limits::from_override(self.max_length))
    }
}

/// Shape of a wire type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    Scalar(ScalarKind),
    Text,
    Sequence(Box<Layout>),
    Map { key: Box<Layout>, value: Box<Layout> },
    /// Ordered member fields. Order is the schema.
    Composite(Vec<Field>),
}

impl Layout {
    pub fn sequence(element: Layout) -> Self {
        Layout::Sequence(Box::new(element))
    }

    pub fn map(key: Layout, value: Layout) -> Self {
        Layout::Map {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    /// Exact number of bytes this layout occupies under `limits`.
    pub fn size(&self, limits: Limits) -> Result<usize> {
        match self {
            Layout::Scalar(kind) => Ok(kind.width()),
            Layout::Text => checked_add(LENGTH_PREFIX_SIZE, limits.max_string),
            Layout::Sequence(element) => {
                if matches!(**element, Layout::Sequence(_)) {
                    return Err(ProtocolError::UnsupportedShape(
                        constants::ERR_MULTI_DIMENSIONAL.to_string(),
                    ));
                }
                let element = element.size(Limits::default())?;
                checked_add(LENGTH_PREFIX_SIZE, checked_mul(element, limits.max_indices)?)
            }
            Layout::Map { key, value } => {
                let entry = checked_add(key.size(Limits::default())?, value.size(Limits::default())?)?;
                checked_add(LENGTH_PREFIX_SIZE, checked_mul(entry, limits.max_indices)?)
            }
            Layout::Composite(fields) => fields
                .iter()
                .try_fold(0usize, |sum, field| checked_add(sum, field.size()?)),
        }
    }

    /// Human-readable schema string, stable across processes.
    ///
    /// Used for registry fingerprints, so field names, order and overrides all
    /// contribute.
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Scalar(kind) => f.write_str(kind.name()),
            Layout::Text => f.write_str("text"),
            Layout::Sequence(element) => write!(f, "[{element}]"),
            Layout::Map { key, value } => write!(f, "{{{key}: {value}}}"),
            Layout::Composite(fields) => {
                f.write_str("(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.layout)?;
                    if let Some(max) = field.max_length {
                        write!(f, " <= {max}")?;
                    }
                }
                f.write_str(")")
            }
        }
    }
}

fn checked_add(a: usize, b: usize) -> Result<usize> {
    a.checked_add(b)
        .ok_or_else(|| ProtocolError::UnsupportedShape(constants::ERR_LAYOUT_OVERFLOW.to_string()))
}

fn checked_mul(a: usize, b: usize) -> Result<usize> {
    a.checked_mul(b)
        .ok_or_else(|| ProtocolError::UnsupportedShape(constants::ERR_LAYOUT_OVERFLOW.to_string()))
}
