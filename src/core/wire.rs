//! # Value Codec
//!
//! Encodes values into the fixed layout described by [`Layout`] and decodes
//! them back. Every encoding has exactly the length the size resolver
//! predicts: variable-length content is written after a 4-byte little-endian
//! length or count and zero-padded up to its reserved size.
//!
//! ## Wire Rules
//! - Scalars: little-endian at natural width, `bool` as a single `0`/`1` byte,
//!   `char` as its `u32` scalar value
//! - Text: `[len u32][utf-8 bytes][zero pad]`, `len <= max_string`
//! - Sequence: `[count u32][element]*count[zero pad]`, `count <= max_indices`
//! - Map: `[count u32][key]*count[value]*count[zero pad]`
//! - Composite: member encodings concatenated in declaration order
//!
//! `Option<T>` lets nullable fields be declared, but `None` is never encodable.

use crate::config::LENGTH_PREFIX_SIZE;
use crate::core::layout::{Layout, Limits, ScalarKind};
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut};
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

/// A type with a fixed-size wire encoding.
///
/// `limits` carries the bounds for the field being encoded. Scalars and
/// composites ignore it; text, sequences and maps apply it to themselves only.
pub trait FixedLayout: Sized {
    /// Schema of this type
    fn layout() -> Layout;

    /// Exact encoded size under `limits`
    fn encoded_size(limits: Limits) -> Result<usize> {
        Self::layout().size(limits)
    }

    /// Append the encoding of `self` to `out`.
    ///
    /// Implementations may leave partial output behind on error; [`encode_into`]
    /// truncates it.
    fn encode_field(&self, limits: Limits, out: &mut Vec<u8>) -> Result<()>;

    /// Decode from a region of exactly `encoded_size(limits)` bytes.
    fn decode_field(bytes: &[u8], limits: Limits) -> Result<Self>;
}

/// Byte size of `T` with an optional field override.
pub fn size_of<T: FixedLayout>(max_length: Option<usize>) -> Result<usize> {
    T::encoded_size(Limits::from_override(max_length))
}

/// Encode `value` into a freshly allocated buffer.
pub fn encode<T: FixedLayout>(value: &T, max_length: Option<usize>) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size_of::<T>(max_length)?);
    encode_into(value, max_length, &mut out)?;
    Ok(out)
}

/// Append the encoding of `value` to `out`. On error `out` is left as it was.
pub fn encode_into<T: FixedLayout>(
    value: &T,
    max_length: Option<usize>,
    out: &mut Vec<u8>,
) -> Result<()> {
    let start = out.len();
    let result = value.encode_field(Limits::from_override(max_length), out);
    if result.is_err() {
        out.truncate(start);
    }
    result
}

/// Decode a `T` from exactly `size_of::<T>(max_length)` bytes.
pub fn decode<T: FixedLayout>(bytes: &[u8], max_length: Option<usize>) -> Result<T> {
    let limits = Limits::from_override(max_length);
    expect_region(bytes, T::encoded_size(limits)?, "body")?;
    T::decode_field(bytes, limits)
}

/// Encode one composite member with its own override.
#[doc(hidden)]
pub fn encode_member<T: FixedLayout>(
    value: &T,
    max_length: Option<usize>,
    out: &mut Vec<u8>,
) -> Result<()> {
    value.encode_field(Limits::from_override(max_length), out)
}

/// Cursor over the consecutive member regions of a composite.
#[doc(hidden)]
pub struct FieldReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    pub fn read<T: FixedLayout>(&mut self, max_length: Option<usize>) -> Result<T> {
        let limits = Limits::from_override(max_length);
        let size = T::encoded_size(limits)?;
        let end = self
            .cursor
            .checked_add(size)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(ProtocolError::MalformedLength {
                what: "composite",
                len: self.bytes.len(),
                max: self.cursor.saturating_add(size),
            })?;
        let value = T::decode_field(&self.bytes[self.cursor..end], limits)?;
        self.cursor = end;
        Ok(value)
    }

    /// Every byte of the region must belong to some member.
    pub fn finish(self) -> Result<()> {
        if self.cursor != self.bytes.len() {
            return Err(ProtocolError::MalformedLength {
                what: "composite",
                len: self.bytes.len(),
                max: self.cursor,
            });
        }
        Ok(())
    }
}

fn expect_region(bytes: &[u8], size: usize, what: &'static str) -> Result<()> {
    if bytes.len() != size {
        return Err(ProtocolError::MalformedLength {
            what,
            len: bytes.len(),
            max: size,
        });
    }
    Ok(())
}

fn put_prefix(out: &mut Vec<u8>, len: usize, kind: &'static str) -> Result<()> {
    let prefix = u32::try_from(len).map_err(|_| ProtocolError::FieldTooLarge {
        kind,
        len,
        max: u32::MAX as usize,
    })?;
    out.put_u32_le(prefix);
    Ok(())
}

/// Zero-fill from `start` up to `start + reserved`.
fn pad_to(out: &mut Vec<u8>, start: usize, reserved: usize) {
    let written = out.len() - start;
    if written < reserved {
        out.put_bytes(0, reserved - written);
    }
}

macro_rules! impl_scalar {
    ($($ty:ty => $kind:ident, $put:ident, $get:ident;)*) => {
        $(
            impl FixedLayout for $ty {
                fn layout() -> Layout {
                    Layout::Scalar(ScalarKind::$kind)
                }

                fn encoded_size(_limits: Limits) -> Result<usize> {
                    Ok(ScalarKind::$kind.width())
                }

                fn encode_field(&self, _limits: Limits, out: &mut Vec<u8>) -> Result<()> {
                    out.$put(*self);
                    Ok(())
                }

                fn decode_field(bytes: &[u8], _limits: Limits) -> Result<Self> {
                    expect_region(bytes, ScalarKind::$kind.width(), ScalarKind::$kind.name())?;
                    let mut buf = bytes;
                    Ok(buf.$get())
                }
            }
        )*
    };
}

impl_scalar! {
    u8 => U8, put_u8, get_u8;
    i8 => I8, put_i8, get_i8;
    u16 => U16, put_u16_le, get_u16_le;
    i16 => I16, put_i16_le, get_i16_le;
    u32 => U32, put_u32_le, get_u32_le;
    i32 => I32, put_i32_le, get_i32_le;
    u64 => U64, put_u64_le, get_u64_le;
    i64 => I64, put_i64_le, get_i64_le;
    f32 => F32, put_f32_le, get_f32_le;
    f64 => F64, put_f64_le, get_f64_le;
}

impl FixedLayout for bool {
    fn layout() -> Layout {
        Layout::Scalar(ScalarKind::Bool)
    }

    fn encoded_size(_limits: Limits) -> Result<usize> {
        Ok(1)
    }

    fn encode_field(&self, _limits: Limits, out: &mut Vec<u8>) -> Result<()> {
        out.put_u8(u8::from(*self));
        Ok(())
    }

    fn decode_field(bytes: &[u8], _limits: Limits) -> Result<Self> {
        expect_region(bytes, 1, "bool")?;
        Ok(bytes[0] != 0)
    }
}

impl FixedLayout for char {
    fn layout() -> Layout {
        Layout::Scalar(ScalarKind::Char)
    }

    fn encoded_size(_limits: Limits) -> Result<usize> {
        Ok(ScalarKind::Char.width())
    }

    fn encode_field(&self, _limits: Limits, out: &mut Vec<u8>) -> Result<()> {
        out.put_u32_le(u32::from(*self));
        Ok(())
    }

    fn decode_field(bytes: &[u8], _limits: Limits) -> Result<Self> {
        expect_region(bytes, ScalarKind::Char.width(), "char")?;
        let mut buf = bytes;
        let scalar = buf.get_u32_le();
        char::from_u32(scalar)
            .ok_or_else(|| ProtocolError::InvalidEncoding(format!("invalid char scalar {scalar:#x}")))
    }
}

impl FixedLayout for String {
    fn layout() -> Layout {
        Layout::Text
    }

    fn encode_field(&self, limits: Limits, out: &mut Vec<u8>) -> Result<()> {
        let len = self.len();
        if len > limits.max_string {
            return Err(ProtocolError::FieldTooLarge {
                kind: "text",
                len,
                max: limits.max_string,
            });
        }
        let start = out.len();
        put_prefix(out, len, "text")?;
        out.put_slice(self.as_bytes());
        pad_to(out, start, LENGTH_PREFIX_SIZE + limits.max_string);
        Ok(())
    }

    fn decode_field(bytes: &[u8], limits: Limits) -> Result<Self> {
        expect_region(bytes, Self::encoded_size(limits)?, "text")?;
        let mut buf = bytes;
        let len = buf.get_u32_le() as usize;
        if len > limits.max_string {
            return Err(ProtocolError::MalformedLength {
                what: "text",
                len,
                max: limits.max_string,
            });
        }
        let text = &bytes[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len];
        String::from_utf8(text.to_vec())
            .map_err(|e| ProtocolError::InvalidEncoding(format!("{}: {e}", constants::ERR_INVALID_UTF8)))
    }
}

impl<T: FixedLayout> FixedLayout for Vec<T> {
    fn layout() -> Layout {
        Layout::sequence(T::layout())
    }

    fn encode_field(&self, limits: Limits, out: &mut Vec<u8>) -> Result<()> {
        // also rejects multi-dimensional sequences
        let reserved = Self::encoded_size(limits)?;
        if self.len() > limits.max_indices {
            return Err(ProtocolError::FieldTooLarge {
                kind: "sequence",
                len: self.len(),
                max: limits.max_indices,
            });
        }
        let start = out.len();
        put_prefix(out, self.len(), "sequence")?;
        for element in self {
            element.encode_field(Limits::default(), out)?;
        }
        pad_to(out, start, reserved);
        Ok(())
    }

    fn decode_field(bytes: &[u8], limits: Limits) -> Result<Self> {
        expect_region(bytes, Self::encoded_size(limits)?, "sequence")?;
        let mut buf = bytes;
        let count = buf.get_u32_le() as usize;
        if count > limits.max_indices {
            return Err(ProtocolError::MalformedLength {
                what: "sequence",
                len: count,
                max: limits.max_indices,
            });
        }
        let element_size = T::encoded_size(Limits::default())?;
        let mut elements = Vec::with_capacity(count);
        for i in 0..count {
            let offset = LENGTH_PREFIX_SIZE + i * element_size;
            elements.push(T::decode_field(
                &bytes[offset..offset + element_size],
                Limits::default(),
            )?);
        }
        Ok(elements)
    }
}

impl<T: FixedLayout> FixedLayout for Option<T> {
    fn layout() -> Layout {
        T::layout()
    }

    fn encoded_size(limits: Limits) -> Result<usize> {
        T::encoded_size(limits)
    }

    fn encode_field(&self, limits: Limits, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Some(value) => value.encode_field(limits, out),
            None => Err(ProtocolError::UnsupportedValue(constants::ERR_NULL_VALUE)),
        }
    }

    fn decode_field(bytes: &[u8], limits: Limits) -> Result<Self> {
        T::decode_field(bytes, limits).map(Some)
    }
}

fn encode_entries<'a, K, V>(
    entries: Vec<(&'a K, &'a V)>,
    reserved: usize,
    limits: Limits,
    out: &mut Vec<u8>,
) -> Result<()>
where
    K: FixedLayout + 'a,
    V: FixedLayout + 'a,
{
    if entries.len() > limits.max_indices {
        return Err(ProtocolError::FieldTooLarge {
            kind: "map",
            len: entries.len(),
            max: limits.max_indices,
        });
    }
    let start = out.len();
    put_prefix(out, entries.len(), "map")?;
    for (key, _) in &entries {
        key.encode_field(Limits::default(), out)?;
    }
    for (_, value) in &entries {
        value.encode_field(Limits::default(), out).map_err(|e| match e {
            ProtocolError::UnsupportedValue(_) => {
                ProtocolError::UnsupportedValue(constants::ERR_NULL_MAP_VALUE)
            }
            other => other,
        })?;
    }
    pad_to(out, start, reserved);
    Ok(())
}

/// Decodes the keys block followed by the values block, in wire order.
fn decode_entries<K: FixedLayout, V: FixedLayout>(
    bytes: &[u8],
    reserved: usize,
    limits: Limits,
) -> Result<Vec<(K, V)>> {
    expect_region(bytes, reserved, "map")?;
    let mut buf = bytes;
    let count = buf.get_u32_le() as usize;
    if count > limits.max_indices {
        return Err(ProtocolError::MalformedLength {
            what: "map",
            len: count,
            max: limits.max_indices,
        });
    }
    let key_size = K::encoded_size(Limits::default())?;
    let value_size = V::encoded_size(Limits::default())?;
    let values_start = LENGTH_PREFIX_SIZE + count * key_size;

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let key_at = LENGTH_PREFIX_SIZE + i * key_size;
        let value_at = values_start + i * value_size;
        let key = K::decode_field(&bytes[key_at..key_at + key_size], Limits::default())?;
        let value = V::decode_field(&bytes[value_at..value_at + value_size], Limits::default())?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn duplicate_key() -> ProtocolError {
    ProtocolError::InvalidEncoding(constants::ERR_DUPLICATE_MAP_KEY.to_string())
}

impl<K, V, S> FixedLayout for HashMap<K, V, S>
where
    K: FixedLayout + Eq + Hash,
    V: FixedLayout,
    S: BuildHasher + Default,
{
    fn layout() -> Layout {
        Layout::map(K::layout(), V::layout())
    }

    fn encode_field(&self, limits: Limits, out: &mut Vec<u8>) -> Result<()> {
        let reserved = Self::encoded_size(limits)?;
        encode_entries(self.iter().collect(), reserved, limits, out)
    }

    fn decode_field(bytes: &[u8], limits: Limits) -> Result<Self> {
        let entries = decode_entries::<K, V>(bytes, Self::encoded_size(limits)?, limits)?;
        let mut map = HashMap::with_capacity_and_hasher(entries.len(), S::default());
        for (key, value) in entries {
            if map.insert(key, value).is_some() {
                return Err(duplicate_key());
            }
        }
        Ok(map)
    }
}

impl<K, V> FixedLayout for BTreeMap<K, V>
where
    K: FixedLayout + Ord,
    V: FixedLayout,
{
    fn layout() -> Layout {
        Layout::map(K::layout(), V::layout())
    }

    fn encode_field(&self, limits: Limits, out: &mut Vec<u8>) -> Result<()> {
        let reserved = Self::encoded_size(limits)?;
        encode_entries(self.iter().collect(), reserved, limits, out)
    }

    fn decode_field(bytes: &[u8], limits: Limits) -> Result<Self> {
        let entries = decode_entries::<K, V>(bytes, Self::encoded_size(limits)?, limits)?;
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            if map.insert(key, value).is_some() {
                return Err(duplicate_key());
            }
        }
        Ok(map)
    }
}
