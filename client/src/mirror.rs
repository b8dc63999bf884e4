//! Client-side read-only copy of one server registry
//!
//! The mirror is seeded by a snapshot and then follows the server's batches.
//! Listeners are told that "something changed" and are expected to rescan the
//! whole mirror rather than track individual changes; with a few dozen
//! resources that is cheap and cannot drift out of order.

use shared::{
    ApplyOutcome, MapBatch, MapSnapshot, MirrorMap, OwnerId, RegistryKind, ResourceId,
};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// How long to wait for a requested snapshot before asking again
const RESYNC_RETRY: Duration = Duration::from_millis(500);

/// Effect of an incoming update on the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Changed,
    Unchanged,
    /// A batch was missed or no snapshot has arrived; a snapshot is needed
    OutOfSync,
}

type ChangeListener = Box<dyn FnMut(&RegistryMirror) + Send>;

pub struct RegistryMirror {
    kind: RegistryKind,
    owners: MirrorMap<ResourceId, OwnerId>,
    labels: MirrorMap<ResourceId, String>,
    ready: bool,
    sync_requested_at: Option<Instant>,
    listeners: Vec<ChangeListener>,
}

impl RegistryMirror {
    pub fn new(kind: RegistryKind) -> Self {
        Self {
            kind,
            owners: MirrorMap::new(),
            labels: MirrorMap::new(),
            ready: false,
            sync_requested_at: None,
            listeners: Vec::new(),
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    /// True once the first snapshot has been loaded
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// True while both maps follow the server's revision sequence
    pub fn is_synced(&self) -> bool {
        self.owners.is_synced() && self.labels.is_synced()
    }

    /// Registers a callback fired after every change to either map
    pub fn on_changed<F>(&mut self, listener: F)
    where
        F: FnMut(&RegistryMirror) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn apply_snapshot(
        &mut self,
        owners: &MapSnapshot<ResourceId, OwnerId>,
        labels: &MapSnapshot<ResourceId, String>,
    ) -> UpdateOutcome {
        let changed = self.owners.load_snapshot(owners) | self.labels.load_snapshot(labels);

        if self.is_synced() {
            self.ready = true;
            self.sync_requested_at = None;
        }

        if changed {
            self.notify();
            UpdateOutcome::Changed
        } else {
            UpdateOutcome::Unchanged
        }
    }

    pub fn apply_update(
        &mut self,
        owners: Option<&MapBatch<ResourceId, OwnerId>>,
        labels: Option<&MapBatch<ResourceId, String>>,
    ) -> UpdateOutcome {
        let owners = owners.map(|batch| Self::follow(&mut self.owners, batch));
        let labels = labels.map(|batch| Self::follow(&mut self.labels, batch));
        let outcomes = [owners, labels];

        let changed = outcomes.contains(&Some(ApplyOutcome::Applied));
        if changed {
            self.notify();
        }

        let lost = outcomes
            .iter()
            .flatten()
            .any(|o| matches!(o, ApplyOutcome::Gap { .. } | ApplyOutcome::NotSynced));

        if lost || !self.is_synced() {
            UpdateOutcome::OutOfSync
        } else if changed {
            UpdateOutcome::Changed
        } else {
            UpdateOutcome::Unchanged
        }
    }

    /// Whether a snapshot request should go out now. Records the request so
    /// repeated gaps do not flood the server.
    pub fn should_request_sync(&mut self, now: Instant) -> bool {
        match self.sync_requested_at {
            Some(at) if now.duration_since(at) < RESYNC_RETRY => false,
            _ => {
                self.sync_requested_at = Some(now);
                true
            }
        }
    }

    pub fn owner_of(&self, resource_id: ResourceId) -> Option<OwnerId> {
        self.owners.get(&resource_id).copied()
    }

    pub fn label_of(&self, resource_id: ResourceId) -> Option<&str> {
        self.labels.get(&resource_id).map(String::as_str)
    }

    /// The resource held by `owner`, if any
    pub fn find_resource_owned_by(&self, owner: OwnerId) -> Option<ResourceId> {
        self.owners
            .iter()
            .find(|(_, o)| **o == owner)
            .map(|(resource_id, _)| *resource_id)
    }

    pub fn reservations(&self) -> BTreeMap<ResourceId, OwnerId> {
        self.owners.to_map()
    }

    pub fn labels(&self) -> BTreeMap<ResourceId, String> {
        self.labels.to_map()
    }

    fn follow<V: Clone>(
        map: &mut MirrorMap<ResourceId, V>,
        batch: &MapBatch<ResourceId, V>,
    ) -> ApplyOutcome {
        let outcome = map.apply(batch);
        if let ApplyOutcome::Gap { .. } = outcome {
            map.invalidate();
        }
        outcome
    }

    fn notify(&mut self) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            listener(self);
        }
        // Keep any listener registered from inside a callback
        listeners.append(&mut self.listeners);
        self.listeners = listeners;
    }
}

impl fmt::Debug for RegistryMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryMirror")
            .field("kind", &self.kind)
            .field("owners", &self.owners)
            .field("labels", &self.labels)
            .field("ready", &self.ready)
            .finish()
    }
}
