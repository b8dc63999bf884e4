//! Exclusive resource reservations, one registry per resource class
//!
//! A [`ReservationRegistry`] replicates two maps to every client, `owners`
//! (resource -> owner) and `labels` (resource -> display label), and keeps a
//! server-local reverse index (owner -> resource) for lookups during claim
//! processing. It enforces:
//! - at most one owner per resource
//! - at most one resource per owner (claiming another one moves the
//!   reservation in a single committed batch)
//! - `labels` and the reverse index always match `owners`
//!
//! The registry has no locking of its own. The server owns it from a single
//! task, so every check-then-write below is one critical section.

use crate::catalog::ResourceCatalog;
use crate::claims::ClaimError;
use log::debug;
use shared::{
    MapBatch, OwnerId, Packet, RegistryKind, ReplicatedMap, ResourceId, ResourcePayload,
};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Everything one registry operation committed, broadcast as a single packet
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryDelta {
    pub registry: RegistryKind,
    pub owners: Option<MapBatch<ResourceId, OwnerId>>,
    pub labels: Option<MapBatch<ResourceId, String>>,
}

impl RegistryDelta {
    pub fn into_packet(self) -> Packet {
        Packet::RegistryUpdate {
            registry: self.registry,
            owners: self.owners,
            labels: self.labels,
        }
    }
}

/// Disagreement between the registry's maps. Unreachable unless the
/// single-writer discipline is broken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("resource {resource_id} is owned by {owner} but the reverse index disagrees")]
    MissingReverseEntry { resource_id: ResourceId, owner: OwnerId },
    #[error("reverse index maps owner {owner} to {resource_id} which it does not own")]
    DanglingReverseEntry { owner: OwnerId, resource_id: ResourceId },
    #[error("label map keys differ from owner map keys")]
    LabelsOutOfStep,
    #[error("resource {resource_id} is outside the catalog")]
    ResourceOutOfRange { resource_id: ResourceId },
}

type DeltaListener = Box<dyn FnMut(&RegistryDelta) + Send>;

pub struct ReservationRegistry {
    catalog: ResourceCatalog,
    owners: ReplicatedMap<ResourceId, OwnerId>,
    labels: ReplicatedMap<ResourceId, String>,
    by_owner: HashMap<OwnerId, ResourceId>,
    listeners: Vec<DeltaListener>,
}

impl ReservationRegistry {
    pub fn new(catalog: ResourceCatalog) -> Self {
        Self {
            catalog,
            owners: ReplicatedMap::new(),
            labels: ReplicatedMap::new(),
            by_owner: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.catalog.kind()
    }

    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    /// Registers a listener called after every committed operation
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&RegistryDelta) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Makes `owner` the holder of `resource_id`.
    ///
    /// Fails without touching state if the resource is unknown or held by
    /// someone else. If the owner already holds a different resource here,
    /// that reservation is dropped in the same batch as the new one is added.
    /// Returns `Ok(None)` when the owner already held exactly this resource.
    pub fn try_claim(
        &mut self,
        owner: OwnerId,
        resource_id: ResourceId,
        label: &str,
    ) -> Result<Option<RegistryDelta>, ClaimError> {
        if !self.catalog.contains(resource_id) {
            return Err(ClaimError::UnknownResource {
                registry: self.kind(),
                resource_id,
            });
        }

        match self.owners.get(&resource_id) {
            Some(&holder) if holder != owner => {
                return Err(ClaimError::AlreadyTaken {
                    resource_id,
                    holder,
                });
            }
            Some(_) => return Ok(None),
            None => {}
        }

        let previous = self.by_owner.get(&owner).copied();

        let owners = self.owners.transact(|tx| {
            if let Some(old) = previous {
                tx.remove(&old);
            }
            tx.set(resource_id, owner);
        });
        let labels = self.labels.transact(|tx| {
            if let Some(old) = previous {
                tx.remove(&old);
            }
            tx.set(resource_id, label.to_string());
        });
        self.by_owner.insert(owner, resource_id);

        match previous {
            Some(old) => debug!(
                "{} registry: owner {} moved from {} to {}",
                self.kind(),
                owner,
                old,
                resource_id
            ),
            None => debug!(
                "{} registry: owner {} claimed {}",
                self.kind(),
                owner,
                resource_id
            ),
        }

        Ok(Some(self.commit(owners, labels)))
    }

    /// Releases `resource_id` on behalf of `owner`, who must hold it
    pub fn release(
        &mut self,
        owner: OwnerId,
        resource_id: ResourceId,
    ) -> Result<RegistryDelta, ClaimError> {
        if !self.catalog.contains(resource_id) {
            return Err(ClaimError::UnknownResource {
                registry: self.kind(),
                resource_id,
            });
        }

        if self.owners.get(&resource_id) != Some(&owner) {
            return Err(ClaimError::NotOwner {
                resource_id,
                requester: owner,
            });
        }

        Ok(self.remove_reservation(owner, resource_id))
    }

    /// Drops whatever `owner` holds in this registry. Calling it again, or
    /// for an owner holding nothing, is a no-op returning `None`.
    pub fn release_all_for(&mut self, owner: OwnerId) -> Option<RegistryDelta> {
        let resource_id = self.by_owner.get(&owner).copied()?;
        Some(self.remove_reservation(owner, resource_id))
    }

    pub fn find_resource_owned_by(&self, owner: OwnerId) -> Option<ResourceId> {
        self.by_owner.get(&owner).copied()
    }

    pub fn owner_of(&self, resource_id: ResourceId) -> Option<OwnerId> {
        self.owners.get(&resource_id).copied()
    }

    pub fn label_of(&self, resource_id: ResourceId) -> Option<&str> {
        self.labels.get(&resource_id).map(String::as_str)
    }

    pub fn payload(&self, resource_id: ResourceId) -> Option<&ResourcePayload> {
        self.catalog.payload(resource_id)
    }

    /// Current reservations, ordered by resource id
    pub fn reservations(&self) -> BTreeMap<ResourceId, OwnerId> {
        self.owners.iter().map(|(r, o)| (*r, *o)).collect()
    }

    pub fn reserved_count(&self) -> usize {
        self.owners.len()
    }

    /// Full state for a joining client
    pub fn snapshot_packet(&self) -> Packet {
        Packet::Snapshot {
            registry: self.kind(),
            owners: self.owners.snapshot(),
            labels: self.labels.snapshot(),
        }
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for (&resource_id, &owner) in self.owners.iter() {
            if !self.catalog.contains(resource_id) {
                return Err(InvariantViolation::ResourceOutOfRange { resource_id });
            }
            if self.by_owner.get(&owner) != Some(&resource_id) {
                return Err(InvariantViolation::MissingReverseEntry { resource_id, owner });
            }
        }

        for (&owner, &resource_id) in &self.by_owner {
            if self.owners.get(&resource_id) != Some(&owner) {
                return Err(InvariantViolation::DanglingReverseEntry { owner, resource_id });
            }
        }

        if !self.owners.keys().eq(self.labels.keys()) {
            return Err(InvariantViolation::LabelsOutOfStep);
        }

        Ok(())
    }

    fn remove_reservation(&mut self, owner: OwnerId, resource_id: ResourceId) -> RegistryDelta {
        let owners = self.owners.remove(&resource_id);
        let labels = self.labels.remove(&resource_id);
        self.by_owner.remove(&owner);

        debug!(
            "{} registry: owner {} released {}",
            self.kind(),
            owner,
            resource_id
        );

        self.commit(owners, labels)
    }

    fn commit(
        &mut self,
        owners: Option<MapBatch<ResourceId, OwnerId>>,
        labels: Option<MapBatch<ResourceId, String>>,
    ) -> RegistryDelta {
        debug_assert_eq!(self.check_invariants(), Ok(()));

        let delta = RegistryDelta {
            registry: self.kind(),
            owners,
            labels,
        };
        for listener in &mut self.listeners {
            listener(&delta);
        }
        delta
    }
}

/// All registries of a session, keyed by resource class
pub struct Reservations {
    registries: BTreeMap<RegistryKind, ReservationRegistry>,
}

impl Reservations {
    pub fn new(catalogs: impl IntoIterator<Item = ResourceCatalog>) -> Self {
        let registries = catalogs
            .into_iter()
            .map(|catalog| (catalog.kind(), ReservationRegistry::new(catalog)))
            .collect();
        Self { registries }
    }

    pub fn get(&self, kind: RegistryKind) -> Option<&ReservationRegistry> {
        self.registries.get(&kind)
    }

    pub fn get_mut(&mut self, kind: RegistryKind) -> Option<&mut ReservationRegistry> {
        self.registries.get_mut(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReservationRegistry> {
        self.registries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ReservationRegistry> {
        self.registries.values_mut()
    }
}
