//! # Core Protocol Components
//!
//! Fixed-layout schemas, the value codec, the packet model and stream framing.
//!
//! ## Components
//! - **Layout**: Explicit schema descriptors and the size resolver
//! - **Wire**: Encode/decode of values into their fixed-size slots
//! - **Packet**: The `Packet` trait, 16-byte identifiers and the `packet!` macro
//! - **Codec**: Tokio codec framing `[identifier][body]` over async streams
//!
//! ## Wire Format
//! ```text
//! [PacketId(16)] [Body(size_of(P))]
//! ```
//!
//! There is no length prefix, checksum or version byte. Both ends derive the
//! body length from the packet schema, so the schemas must match exactly.

pub mod codec;
pub mod layout;
pub mod packet;
pub mod wire;
