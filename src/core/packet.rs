//! # Packets
//!
//! A packet is a plain value aggregate with a fixed-layout body, tagged on the
//! wire by a 16-byte [`PacketId`] derived from its fully qualified name.
//!
//! ## Wire Format
//! ```text
//! [PacketId(16)] [Body(size_of(P))]
//! ```
//! The body is omitted entirely when the packet has no fields.
//!
//! ## Declaring packets
//! ```rust
//! use packet_protocol::packet;
//! use packet_protocol::core::packet::Packet;
//!
//! packet! {
//!     #[derive(Debug, Clone, Default, PartialEq)]
//!     pub struct Login {
//!         #[max_length(16)]
//!         pub name: String,
//!         pub age: i32,
//!     }
//! }
//!
//! assert_eq!(Login::body_size().unwrap(), (4 + 16) + 4);
//! ```
//!
//! The identifier depends only on the name, not on the fields. Two builds
//! that disagree on a packet's fields still share its identifier; compare
//! [`PacketRegistry::fingerprint`](crate::protocol::registry::PacketRegistry::fingerprint)
//! out of band to catch that.

use crate::config::PACKET_ID_SIZE;
use crate::core::layout::Limits;
use crate::core::wire::{self, FixedLayout};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable 16-byte identifier naming a packet type on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId([u8; PACKET_ID_SIZE]);

impl PacketId {
    /// Derive the identifier for a fully qualified type name.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut id = [0u8; PACKET_ID_SIZE];
        id.copy_from_slice(&digest[..PACKET_ID_SIZE]);
        Self(id)
    }

    pub const fn from_bytes(bytes: [u8; PACKET_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; PACKET_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId({self})")
    }
}

/// A value that travels as one message.
///
/// `Default` is the empty state decoding starts from; a type without one
/// cannot be a packet.
pub trait Packet: FixedLayout + Default + Send + 'static {
    /// Fully qualified name the identifier is derived from
    const NAME: &'static str;

    fn packet_id() -> PacketId {
        PacketId::from_name(Self::NAME)
    }

    /// Body size in bytes, excluding the identifier
    fn body_size() -> Result<usize> {
        Self::encoded_size(Limits::default())
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        wire::encode(self, None)
    }

    /// Identifier followed by the body, ready for the stream.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(PACKET_ID_SIZE + Self::body_size()?);
        out.extend_from_slice(Self::packet_id().as_bytes());
        wire::encode_into(self, None, &mut out)?;
        Ok(out)
    }

    fn from_body(body: &[u8]) -> Result<Self> {
        wire::decode(body, None)
    }
}

/// Declare a packet struct together with its explicit wire schema.
///
/// Fields are encoded in the order written. `#[max_length(N)]` overrides the
/// text and sequence bounds of a single field; any other field attribute,
/// doc comments included, is passed through to the struct. The identifier is
/// derived from `module_path!()::Name` unless a wire name is given with
/// `as "name"`:
///
/// ```rust
/// use packet_protocol::packet;
///
/// packet! {
///     #[derive(Debug, Default)]
///     pub struct Tick as "ticker.Tick" {
///         /// Exchange symbol
///         #[max_length(8)]
///         pub symbol: String,
///         pub price: f64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! packet {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident $(as $wire_name:literal)? {
            $(
                $(#[$($fattr:tt)*])*
                $field_vis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $crate::__packet_struct! {
            @meta [$(#[$meta])*]
            @head [$vis struct $name]
            @done []
            @fields [$( { [] [$( [$($fattr)*] )*] $field_vis $field : $ty } )*]
        }

        impl $crate::core::wire::FixedLayout for $name {
            fn layout() -> $crate::core::layout::Layout {
                $crate::core::layout::Layout::Composite(::std::vec![
                    $(
                        $crate::core::layout::Field::new(
                            stringify!($field),
                            <$ty as $crate::core::wire::FixedLayout>::layout(),
                            $crate::__max_length!($( [$($fattr)*] )*),
                        ),
                    )*
                ])
            }

            fn encode_field(
                &self,
                _limits: $crate::core::layout::Limits,
                out: &mut ::std::vec::Vec<u8>,
            ) -> $crate::error::Result<()> {
                $(
                    $crate::core::wire::encode_member(
                        &self.$field,
                        $crate::__max_length!($( [$($fattr)*] )*),
                        out,
                    )?;
                )*
                let _ = out;
                Ok(())
            }

            fn decode_field(
                bytes: &[u8],
                _limits: $crate::core::layout::Limits,
            ) -> $crate::error::Result<Self> {
                #[allow(unused_mut)]
                let mut reader = $crate::core::wire::FieldReader::new(bytes);
                #[allow(unused_mut)]
                let mut packet = <Self as ::core::default::Default>::default();
                $(
                    packet.$field = reader.read::<$ty>($crate::__max_length!($( [$($fattr)*] )*))?;
                )*
                reader.finish()?;
                Ok(packet)
            }
        }

        impl $crate::core::packet::Packet for $name {
            const NAME: &'static str = $crate::__packet_name!($name $(, $wire_name)?);
        }
    };
}

/// Emits the struct, dropping `max_length` from each field's attributes.
#[doc(hidden)]
#[macro_export]
macro_rules! __packet_struct {
    (@meta [$($meta:tt)*] @head [$($head:tt)*] @done [$($done:tt)*] @fields []) => {
        $($meta)*
        $($head)* {
            $($done)*
        }
    };
    (
        @meta $meta:tt @head $head:tt @done $done:tt
        @fields [
            { [$($kept:tt)*] [[max_length $($args:tt)*] $($pending:tt)*] $($field:tt)* }
            $($fields:tt)*
        ]
    ) => {
        $crate::__packet_struct! {
            @meta $meta @head $head @done $done
            @fields [{ [$($kept)*] [$($pending)*] $($field)* } $($fields)*]
        }
    };
    (
        @meta $meta:tt @head $head:tt @done $done:tt
        @fields [
            { [$($kept:tt)*] [[$($attr:tt)*] $($pending:tt)*] $($field:tt)* }
            $($fields:tt)*
        ]
    ) => {
        $crate::__packet_struct! {
            @meta $meta @head $head @done $done
            @fields [{ [$($kept)* #[$($attr)*]] [$($pending)*] $($field)* } $($fields)*]
        }
    };
    (
        @meta $meta:tt @head $head:tt @done [$($done:tt)*]
        @fields [{ [$($kept:tt)*] [] $($field:tt)* } $($fields:tt)*]
    ) => {
        $crate::__packet_struct! {
            @meta $meta @head $head @done [$($done)* $($kept)* $($field)*,]
            @fields [$($fields)*]
        }
    };
}

/// First `max_length(N)` among a field's attributes.
#[doc(hidden)]
#[macro_export]
macro_rules! __max_length {
    () => {
        ::core::option::Option::<usize>::None
    };
    ([max_length($max:expr)] $($rest:tt)*) => {
        ::core::option::Option::<usize>::Some($max)
    };
    ([$($other:tt)*] $($rest:tt)*) => {
        $crate::__max_length!($($rest)*)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __packet_name {
    ($name:ident) => {
        concat!(module_path!(), "::", stringify!($name))
    };
    ($name:ident, $wire_name:literal) => {
        $wire_name
    };
}
