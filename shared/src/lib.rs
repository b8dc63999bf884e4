use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod replicated;

pub use replicated::{
    ApplyOutcome, MapBatch, MapChange, MapSnapshot, MapTransaction, MirrorMap, ReplicatedMap,
};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PACKET_SIZE: usize = 4096;
/// Display name limit in UTF-8 bytes
pub const MAX_DISPLAY_NAME_LEN: usize = 24;
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// Participant identifier, stable for the lifetime of a connection
pub type OwnerId = u32;
/// Resource identifier, unique within its registry
pub type ResourceId = u32;

/// The resource classes tracked by the server, one registry each
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegistryKind {
    ColorSlot,
    BoardSpot,
}

impl RegistryKind {
    pub const ALL: [RegistryKind; 2] = [RegistryKind::ColorSlot, RegistryKind::BoardSpot];

    pub fn as_str(self) -> &'static str {
        match self {
            RegistryKind::ColorSlot => "color",
            RegistryKind::BoardSpot => "spot",
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data returned to the requester of a successful claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourcePayload {
    Color { name: String, rgb: [u8; 3] },
    Position { x: f32, y: f32 },
}

/// Why a claim or release was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    AlreadyTaken,
    NotOwner,
    UnknownResource,
    RequesterGone,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Client to server
    Connect {
        client_version: u32,
        display_name: String,
    },
    Heartbeat {
        timestamp: u64,
    },
    ClaimRequest {
        registry: RegistryKind,
        resource_id: ResourceId,
    },
    ReleaseRequest {
        registry: RegistryKind,
        resource_id: ResourceId,
    },
    SyncRequest {
        registry: RegistryKind,
    },
    Disconnect,

    // Server to client
    Connected {
        client_id: OwnerId,
    },
    ClaimResult {
        registry: RegistryKind,
        resource_id: ResourceId,
        ok: bool,
        reason: Option<RejectReason>,
        payload: Option<ResourcePayload>,
    },
    ReleaseResult {
        registry: RegistryKind,
        resource_id: ResourceId,
        ok: bool,
        reason: Option<RejectReason>,
    },
    RegistryUpdate {
        registry: RegistryKind,
        owners: Option<MapBatch<ResourceId, OwnerId>>,
        labels: Option<MapBatch<ResourceId, String>>,
    },
    Snapshot {
        registry: RegistryKind,
        owners: MapSnapshot<ResourceId, OwnerId>,
        labels: MapSnapshot<ResourceId, String>,
    },
    Disconnected {
        reason: String,
    },
}

/// Current wall-clock time in milliseconds
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
