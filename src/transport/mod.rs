//! # Transport Layer
//!
//! Reference transports carrying `[identifier][body]` messages.
//!
//! ## Components
//! - **TCP**: Blocking server and client, one thread per connection
//! - **Local**: Unix domain sockets on tokio, framed by `FrameCodec`

#[cfg(unix)]
pub mod local;
pub mod tcp;
