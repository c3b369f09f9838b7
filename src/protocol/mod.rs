//! # Protocol Layer
//!
//! Packet type registration and per-connection dispatch.
//!
//! ## Components
//! - **Registry**: Shared identifier → packet type map
//! - **Dispatcher**: Reads `[identifier][body]` messages and routes them to handlers

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{DispatchState, Dispatcher};
pub use registry::{PacketRegistry, PacketType};

#[cfg(test)]
mod tests;
