//! # Packet Protocol
//!
//! Fixed-layout binary packets for small, frequent messages between two
//! endpoints that share the same packet definitions.
//!
//! Every packet type has a body of constant size, derived from its schema
//! alone. Text, sequences and maps reserve room for their maximum content
//! and are zero-padded, so no length travels on the wire:
//!
//! ```text
//! [PacketId(16)] [Body(size_of(P))]
//! ```
//!
//! ## Example
//! ```rust
//! use packet_protocol::core::packet::Packet;
//! use packet_protocol::packet;
//! use packet_protocol::protocol::{Dispatcher, PacketRegistry};
//! use std::io::Cursor;
//!
//! packet! {
//!     #[derive(Debug, Default)]
//!     pub struct Person {
//!         #[max_length(16)]
//!         pub name: String,
//!         pub age: i32,
//!     }
//! }
//!
//! let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
//! dispatcher
//!     .register_handler::<Person, _>(|person| assert_eq!(person.age, 25))
//!     .unwrap();
//!
//! let bob = Person { name: "Bob".into(), age: 25 };
//! let mut stream = Cursor::new(bob.to_bytes().unwrap());
//! dispatcher.process_next(&mut stream).unwrap();
//! ```
//!
//! ## Modules
//! - [`core`]: schemas, the value codec, packets and stream framing
//! - [`protocol`]: the shared registry and per-connection dispatch
//! - [`transport`]: reference TCP and Unix socket transports
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::core::packet::{Packet, PacketId};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::{Dispatcher, PacketRegistry};
