//! Participant connect/disconnect handling
//!
//! On connect the newcomer gets its id followed by a snapshot of every
//! registry, queued ahead of any later traffic to it. On disconnect every
//! registry drops whatever the participant held.

use crate::participants::{Participant, ParticipantManager};
use crate::registry::{RegistryDelta, Reservations};
use log::info;
use shared::{OwnerId, Packet};

/// Packets sent to a newly admitted participant, in order
pub fn welcome_packets(participant: &Participant, reservations: &Reservations) -> Vec<Packet> {
    let mut packets = vec![Packet::Connected {
        client_id: participant.id,
    }];
    packets.extend(reservations.iter().map(|r| r.snapshot_packet()));
    packets
}

/// Releases everything `owner` holds, in every registry.
///
/// Safe to call any number of times for the same owner; only the first call
/// produces deltas.
pub fn release_all(reservations: &mut Reservations, owner: OwnerId) -> Vec<RegistryDelta> {
    let deltas: Vec<RegistryDelta> = reservations
        .iter_mut()
        .filter_map(|registry| registry.release_all_for(owner))
        .collect();

    if !deltas.is_empty() {
        info!(
            "Released {} reservation(s) held by participant {}",
            deltas.len(),
            owner
        );
    }
    deltas
}

/// Removes a participant and reclaims its reservations.
///
/// Returns `None` when the participant was already gone, in which case the
/// registries are still swept so a stray reservation cannot outlive its owner.
pub fn disconnect(
    participants: &mut ParticipantManager,
    reservations: &mut Reservations,
    owner: OwnerId,
) -> (Option<Participant>, Vec<RegistryDelta>) {
    let participant = participants.remove(owner);
    let deltas = release_all(reservations, owner);
    (participant, deltas)
}
