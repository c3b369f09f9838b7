//! # Packet Registry
//!
//! Process-wide, append-only map from [`PacketId`] to the packet type it
//! names. Every dispatcher registers the types it handles here; the read
//! path uses it to learn how many body bytes follow an identifier.
//!
//! The registry is built explicitly at startup and shared as
//! `Arc<PacketRegistry>`. Registration from several connection threads at
//! once is safe.

use crate::core::layout::Layout;
use crate::core::packet::{Packet, PacketId};
use crate::error::{constants, ProtocolError, Result};
use sha2::{Digest, Sha256};
use std::any::TypeId;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Handle to a registered packet type.
#[derive(Clone)]
pub struct PacketType {
    id: PacketId,
    name: &'static str,
    body_size: usize,
    schema: Arc<Layout>,
    type_id: TypeId,
    validate: fn(&[u8]) -> Result<()>,
}

impl PacketType {
    /// Build the handle for `P`, resolving its body size once.
    pub fn of<P: Packet>() -> Result<Self> {
        Ok(Self {
            id: P::packet_id(),
            name: P::NAME,
            body_size: P::body_size()?,
            schema: Arc::new(P::layout()),
            type_id: TypeId::of::<P>(),
            validate: validate_body::<P>,
        })
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cached body size in bytes
    pub fn body_size(&self) -> usize {
        self.body_size
    }

    pub fn schema(&self) -> &Layout {
        &self.schema
    }

    pub fn is<P: Packet>(&self) -> bool {
        self.type_id == TypeId::of::<P>()
    }

    /// Decode `body` as this type and discard the value.
    pub fn validate_body(&self, body: &[u8]) -> Result<()> {
        (self.validate)(body)
    }
}

impl fmt::Debug for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("body_size", &self.body_size)
            .finish_non_exhaustive()
    }
}

fn validate_body<P: Packet>(body: &[u8]) -> Result<()> {
    P::from_body(body).map(drop)
}

/// Shared identifier → packet type map.
#[derive(Debug, Default)]
pub struct PacketRegistry {
    types: RwLock<HashMap<PacketId, PacketType>>,
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the usual shared form.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register `P`, returning its identifier. Repeated calls are no-ops.
    ///
    /// Fails with `UnsupportedShape` if `P` has no fixed size, and with
    /// `IdentifierCollision` if a different type already claimed the identifier.
    pub fn register<P: Packet>(&self) -> Result<PacketId> {
        let id = P::packet_id();
        if let Some(existing) = self.read()?.get(&id) {
            return same_type::<P>(existing);
        }

        let packet_type = PacketType::of::<P>()?;
        let mut types = self.write()?;
        match types.entry(id) {
            Entry::Occupied(entry) => same_type::<P>(entry.get()),
            Entry::Vacant(entry) => {
                debug!(
                    packet = P::NAME,
                    id = %id,
                    body_size = packet_type.body_size,
                    "Registered packet type"
                );
                entry.insert(packet_type);
                Ok(id)
            }
        }
    }

    pub fn resolve(&self, id: &PacketId) -> Result<PacketType> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or(ProtocolError::UnknownPacketType(*id))
    }

    pub fn contains(&self, id: &PacketId) -> Result<bool> {
        Ok(self.read()?.contains_key(id))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Result<Vec<&'static str>> {
        let mut names: Vec<_> = self.read()?.values().map(PacketType::name).collect();
        names.sort_unstable();
        Ok(names)
    }

    /// Digest of every registered identifier and schema.
    ///
    /// Independent of registration order. Two processes with equal
    /// fingerprints agree on every packet layout they both know.
    pub fn fingerprint(&self) -> Result<[u8; 32]> {
        let types = self.read()?;
        let mut entries: Vec<_> = types.values().collect();
        entries.sort_unstable_by_key(|packet_type| packet_type.id);

        let mut hasher = Sha256::new();
        for packet_type in entries {
            hasher.update(packet_type.id.as_bytes());
            hasher.update(packet_type.schema.describe().as_bytes());
            hasher.update([0u8]);
        }
        Ok(hasher.finalize().into())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<PacketId, PacketType>>> {
        self.types
            .read()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_REGISTRY_READ_LOCK))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<PacketId, PacketType>>> {
        self.types
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_REGISTRY_WRITE_LOCK))
    }
}

fn same_type<P: Packet>(existing: &PacketType) -> Result<PacketId> {
    if existing.is::<P>() {
        Ok(existing.id)
    } else {
        Err(ProtocolError::IdentifierCollision {
            id: existing.id,
            existing: existing.name,
            name: P::NAME,
        })
    }
}
