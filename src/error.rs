//! # Error Types
//!
//! Error handling for the fixed-layout codec, the packet registry and the
//! dispatcher.
//!
//! ## Error Categories
//! - **Encode Errors**: null values, oversized text/sequences/maps, unsupported shapes
//! - **Decode Errors**: length fields that point outside their reserved region, invalid UTF-8
//! - **Registration Errors**: duplicate handlers, identifier collisions
//! - **Connection Errors**: closed streams, unknown packet identifiers
//!
//! Encode and decode errors are local to the call that raised them. Anything
//! the dispatcher hits while reading a frame is fatal for that connection.
//!
//! ## Example Usage
//! ```rust
//! use packet_protocol::core::wire::encode;
//! use packet_protocol::error::ProtocolError;
//!
//! let long = "x".repeat(32);
//! match encode(&long, Some(16)) {
//!     Err(ProtocolError::FieldTooLarge { len, max, .. }) => assert!(len > max),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use crate::core::packet::PacketId;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry lock errors
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on packet registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on packet registry";

    /// Encode errors
    pub const ERR_NULL_VALUE: &str = "Null values are not supported";
    pub const ERR_NULL_MAP_VALUE: &str = "Null map values are not supported";
    pub const ERR_MULTI_DIMENSIONAL: &str = "Sequences may not exceed a single dimension";
    pub const ERR_LAYOUT_OVERFLOW: &str = "Layout size overflows usize";

    /// Decode errors
    pub const ERR_INVALID_UTF8: &str = "Text field is not valid UTF-8";
    pub const ERR_DUPLICATE_MAP_KEY: &str = "Map contains a repeated key";

    /// Transport lock errors
    pub const ERR_CONNECTION_WRITE_LOCK: &str = "Failed to acquire connection write lock";
    pub const ERR_CLIENT_TABLE_LOCK: &str = "Failed to acquire lock on client table";
}

/// Primary error type for all codec, registry and dispatch operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A value the fixed layout cannot represent, such as `None`.
    #[error("Unsupported value: {0}")]
    UnsupportedValue(&'static str),

    /// Text, sequence or map content exceeds its configured maximum.
    #[error("{kind} too large: {len} exceeds maximum of {max}")]
    FieldTooLarge {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Unsupported shape: {0}")]
    UnsupportedShape(String),

    /// A decoded count/length, or a byte region, does not fit its reserved size.
    #[error("Malformed {what} length: {len} (limit {max})")]
    MalformedLength {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Handler already registered for packet type {0}")]
    DuplicateHandler(&'static str),

    /// Identifier read from the stream is not in the registry. The body length
    /// is unknown, so the stream cannot be resynchronized.
    #[error("Unknown packet type {0}")]
    UnknownPacketType(PacketId),

    #[error("Packet identifier {id} is already taken by {existing}, cannot register {name}")]
    IdentifierCollision {
        id: PacketId,
        existing: &'static str,
        name: &'static str,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Synchronization primitive poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Whether the error ends the connection it occurred on.
    ///
    /// Encode-side and registration errors never do.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::UnsupportedValue(_)
                | ProtocolError::FieldTooLarge { .. }
                | ProtocolError::UnsupportedShape(_)
                | ProtocolError::DuplicateHandler(_)
                | ProtocolError::IdentifierCollision { .. }
                | ProtocolError::ConfigError(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
