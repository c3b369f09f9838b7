//! # Frame Codec
//!
//! `tokio_util` codec splitting an async byte stream into `[identifier][body]`
//! frames. The body length is not on the wire, so the decoder asks the
//! registry for it as soon as the identifier has arrived.

use crate::config::PACKET_ID_SIZE;
use crate::core::packet::{Packet, PacketId};
use crate::error::{ProtocolError, Result};
use crate::protocol::registry::PacketRegistry;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// One message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: PacketId,
    pub body: Bytes,
}

impl Frame {
    pub fn from_packet<P: Packet>(packet: &P) -> Result<Self> {
        Ok(Self {
            id: P::packet_id(),
            body: Bytes::from(packet.encode_body()?),
        })
    }

    /// Decode the body as `P`, if this frame carries a `P`.
    pub fn decode<P: Packet>(&self) -> Result<Option<P>> {
        if self.id != P::packet_id() {
            return Ok(None);
        }
        P::from_body(&self.body).map(Some)
    }

    /// Length on the wire
    pub fn wire_len(&self) -> usize {
        PACKET_ID_SIZE + self.body.len()
    }
}

/// Fixed-layout frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    registry: Arc<PacketRegistry>,
    // identifier already consumed, waiting for its body
    pending: Option<(PacketId, usize)>,
}

impl FrameCodec {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            pending: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let (id, body_size) = match self.pending {
            Some(pending) => pending,
            None => {
                if src.len() < PACKET_ID_SIZE {
                    src.reserve(PACKET_ID_SIZE - src.len());
                    return Ok(None);
                }
                let mut raw = [0u8; PACKET_ID_SIZE];
                raw.copy_from_slice(&src[..PACKET_ID_SIZE]);
                let id = PacketId::from_bytes(raw);
                let body_size = self.registry.resolve(&id)?.body_size();
                src.advance(PACKET_ID_SIZE);
                self.pending = Some((id, body_size));
                (id, body_size)
            }
        };

        if src.len() < body_size {
            src.reserve(body_size - src.len());
            return Ok(None);
        }

        self.pending = None;
        let body = src.split_to(body_size).freeze();
        Ok(Some(Frame { id, body }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(frame.wire_len());
        dst.put_slice(frame.id.as_bytes());
        dst.put_slice(&frame.body);
        Ok(())
    }
}
