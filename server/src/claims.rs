//! Server side of the claim/release request protocol
//!
//! A request is resolved to a participant through its sender address, run
//! against the target registry and answered to the requester alone. The
//! resulting registry change, if any, is handed back separately so the caller
//! can broadcast it to everyone. Every failure becomes a negative reply; no
//! error escapes request processing.

use crate::participants::ParticipantManager;
use crate::registry::{RegistryDelta, Reservations};
use log::{debug, info, warn};
use shared::{OwnerId, Packet, RegistryKind, RejectReason, ResourceId, ResourcePayload};
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimError {
    #[error("resource {resource_id} is already held by participant {holder}")]
    AlreadyTaken {
        resource_id: ResourceId,
        holder: OwnerId,
    },
    #[error("participant {requester} does not hold resource {resource_id}")]
    NotOwner {
        resource_id: ResourceId,
        requester: OwnerId,
    },
    #[error("resource {resource_id} does not exist in the {registry} registry")]
    UnknownResource {
        registry: RegistryKind,
        resource_id: ResourceId,
    },
    #[error("request from {addr} does not belong to a connected participant")]
    RequesterGone { addr: SocketAddr },
}

impl ClaimError {
    pub fn reason(&self) -> RejectReason {
        match self {
            ClaimError::AlreadyTaken { .. } => RejectReason::AlreadyTaken,
            ClaimError::NotOwner { .. } => RejectReason::NotOwner,
            ClaimError::UnknownResource { .. } => RejectReason::UnknownResource,
            ClaimError::RequesterGone { .. } => RejectReason::RequesterGone,
        }
    }

    fn log(&self) {
        match self {
            // Contention is the normal case, not an error
            ClaimError::AlreadyTaken { .. } | ClaimError::NotOwner { .. } => {
                debug!("Request rejected: {}", self)
            }
            ClaimError::UnknownResource { .. } => {
                warn!("Request rejected, client and server disagree on resources: {}", self)
            }
            ClaimError::RequesterGone { .. } => info!("Request dropped: {}", self),
        }
    }
}

/// What the session sends after processing one request
#[derive(Debug)]
pub struct ClaimReply {
    /// Goes to the requester only
    pub response: Packet,
    /// Goes to every participant
    pub delta: Option<RegistryDelta>,
}

pub fn process_claim(
    participants: &ParticipantManager,
    reservations: &mut Reservations,
    addr: SocketAddr,
    registry: RegistryKind,
    resource_id: ResourceId,
) -> ClaimReply {
    match try_claim(participants, reservations, addr, registry, resource_id) {
        Ok((payload, delta)) => ClaimReply {
            response: Packet::ClaimResult {
                registry,
                resource_id,
                ok: true,
                reason: None,
                payload: Some(payload),
            },
            delta,
        },
        Err(e) => {
            e.log();
            ClaimReply {
                response: Packet::ClaimResult {
                    registry,
                    resource_id,
                    ok: false,
                    reason: Some(e.reason()),
                    payload: None,
                },
                delta: None,
            }
        }
    }
}

pub fn process_release(
    participants: &ParticipantManager,
    reservations: &mut Reservations,
    addr: SocketAddr,
    registry: RegistryKind,
    resource_id: ResourceId,
) -> ClaimReply {
    match try_release(participants, reservations, addr, registry, resource_id) {
        Ok(delta) => ClaimReply {
            response: Packet::ReleaseResult {
                registry,
                resource_id,
                ok: true,
                reason: None,
            },
            delta: Some(delta),
        },
        Err(e) => {
            e.log();
            ClaimReply {
                response: Packet::ReleaseResult {
                    registry,
                    resource_id,
                    ok: false,
                    reason: Some(e.reason()),
                },
                delta: None,
            }
        }
    }
}

fn try_claim(
    participants: &ParticipantManager,
    reservations: &mut Reservations,
    addr: SocketAddr,
    registry: RegistryKind,
    resource_id: ResourceId,
) -> Result<(ResourcePayload, Option<RegistryDelta>), ClaimError> {
    let participant = participants
        .find_by_addr(addr)
        .ok_or(ClaimError::RequesterGone { addr })?;

    let unknown = ClaimError::UnknownResource {
        registry,
        resource_id,
    };
    let target = reservations.get_mut(registry).ok_or(unknown)?;

    // Duplicate request for what the participant already holds
    let delta = if target.find_resource_owned_by(participant.id) == Some(resource_id) {
        None
    } else {
        target.try_claim(participant.id, resource_id, &participant.display_name)?
    };

    let payload = target.payload(resource_id).cloned().ok_or(unknown)?;
    Ok((payload, delta))
}

fn try_release(
    participants: &ParticipantManager,
    reservations: &mut Reservations,
    addr: SocketAddr,
    registry: RegistryKind,
    resource_id: ResourceId,
) -> Result<RegistryDelta, ClaimError> {
    let participant = participants
        .find_by_addr(addr)
        .ok_or(ClaimError::RequesterGone { addr })?;

    reservations
        .get_mut(registry)
        .ok_or(ClaimError::UnknownResource {
            registry,
            resource_id,
        })?
        .release(participant.id, resource_id)
}
