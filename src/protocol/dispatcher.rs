use crate::config::PACKET_ID_SIZE;
use crate::core::codec::Frame;
use crate::core::packet::{Packet, PacketId};
use crate::error::{ProtocolError, Result};
use crate::protocol::registry::{PacketRegistry, PacketType};
use crate::utils::metrics::Metrics;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Decodes a body into its concrete packet type and runs the callback.
type HandlerFn = dyn FnMut(&[u8]) -> Result<()> + Send + 'static;

/// Where a dispatcher is in its read cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    ReadingTag,
    ReadingBody,
    Dispatching,
    /// Terminal. Entered on the first error.
    Closed,
}

/// Per-connection packet dispatcher.
///
/// Owns a handler table keyed by packet identifier and drives the blocking
/// read loop for one stream. Packet types are shared through the
/// [`PacketRegistry`]; handlers are not.
pub struct Dispatcher {
    registry: Arc<PacketRegistry>,
    handlers: HashMap<PacketId, Box<HandlerFn>>,
    metrics: Option<Arc<Metrics>>,
    state: DispatchState,
    body: Vec<u8>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
            metrics: None,
            state: DispatchState::Idle,
            body: Vec::new(),
        }
    }

    /// Count received and unhandled packets in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == DispatchState::Closed
    }

    pub fn handles<P: Packet>(&self) -> bool {
        self.handlers.contains_key(&P::packet_id())
    }

    /// Route every decoded `P` to `callback`.
    ///
    /// Also registers `P` in the shared registry. A second callback for the
    /// same type on this dispatcher is rejected.
    pub fn register_handler<P, F>(&mut self, mut callback: F) -> Result<PacketId>
    where
        P: Packet,
        F: FnMut(P) + Send + 'static,
    {
        let id = P::packet_id();
        if self.handlers.contains_key(&id) {
            return Err(ProtocolError::DuplicateHandler(P::NAME));
        }
        self.registry.register::<P>()?;
        self.handlers.insert(
            id,
            Box::new(move |body: &[u8]| {
                callback(P::from_body(body)?);
                Ok(())
            }),
        );
        Ok(id)
    }

    /// Read one message from `stream` and dispatch it.
    ///
    /// Blocks until a full message has arrived. Any error closes the
    /// dispatcher; later calls fail with `ConnectionClosed`.
    pub fn process_next<R: Read + ?Sized>(&mut self, stream: &mut R) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let result = self.read_and_dispatch(stream);
        self.finish(result)
    }

    /// Dispatch a frame already split off an async stream by `FrameCodec`.
    pub fn dispatch_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.state = DispatchState::Dispatching;
        let result = self.resolve(&frame.id).and_then(|packet_type| {
            if frame.body.len() != packet_type.body_size() {
                return Err(ProtocolError::MalformedLength {
                    what: "frame body",
                    len: frame.body.len(),
                    max: packet_type.body_size(),
                });
            }
            self.dispatch_body(&packet_type, &frame.body)
        });
        self.finish(result)
    }

    /// Process messages until the stream closes.
    ///
    /// Returns `Ok(())` when the peer closes the connection, otherwise the
    /// error that terminated it.
    pub fn run<R: Read + ?Sized>(&mut self, stream: &mut R) -> Result<()> {
        loop {
            match self.process_next(stream) {
                Ok(()) => {}
                Err(ProtocolError::ConnectionClosed) => {
                    debug!("Connection closed, dispatcher stopping");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Dispatcher terminated");
                    if let Some(metrics) = &self.metrics {
                        metrics.protocol_error();
                    }
                    return Err(e);
                }
            }
        }
    }

    fn read_and_dispatch<R: Read + ?Sized>(&mut self, stream: &mut R) -> Result<()> {
        self.state = DispatchState::ReadingTag;
        let mut tag = [0u8; PACKET_ID_SIZE];
        read_exact(stream, &mut tag)?;
        let packet_type = self.resolve(&PacketId::from_bytes(tag))?;

        self.state = DispatchState::ReadingBody;
        let mut body = std::mem::take(&mut self.body);
        body.clear();
        body.resize(packet_type.body_size(), 0);
        if !body.is_empty() {
            read_exact(stream, &mut body)?;
        }

        self.state = DispatchState::Dispatching;
        let result = self.dispatch_body(&packet_type, &body);
        self.body = body;
        result
    }

    fn resolve(&self, id: &PacketId) -> Result<PacketType> {
        self.registry.resolve(id).inspect_err(|_| {
            // the body length is unknown, so nothing after this tag can be framed
            warn!(id = %id, "Unknown packet identifier, closing connection");
        })
    }

    fn dispatch_body(&mut self, packet_type: &PacketType, body: &[u8]) -> Result<()> {
        if let Some(metrics) = &self.metrics {
            metrics.packet_received((PACKET_ID_SIZE + body.len()) as u64);
        }
        match self.handlers.get_mut(&packet_type.id()) {
            Some(handler) => {
                trace!(packet = packet_type.name(), "Dispatching packet");
                handler(body)
            }
            None => {
                packet_type.validate_body(body)?;
                trace!(packet = packet_type.name(), "No local handler, dropping packet");
                if let Some(metrics) = &self.metrics {
                    metrics.packet_unhandled();
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self, result: Result<()>) -> Result<()> {
        self.state = match result {
            Ok(()) => DispatchState::Idle,
            Err(_) => DispatchState::Closed,
        };
        result
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Any read failure, clean EOF included, means the connection is gone.
fn read_exact<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).map_err(|e| {
        debug!(error = %e, "Stream read failed");
        ProtocolError::ConnectionClosed
    })
}
