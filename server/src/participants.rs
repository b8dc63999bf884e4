//! Connected participant tracking for the reservation server
//!
//! This module handles the server-side bookkeeping of who is connected:
//! - Participant admission (capacity limit, id assignment, display names)
//! - Resolving the sender address of a request to a participant id
//! - Liveness tracking so silent participants can be expired
//!
//! Reservations themselves live in the registries; this module only answers
//! "who is this" and "who is still here".

use log::info;
use shared::{OwnerId, MAX_DISPLAY_NAME_LEN};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A connected player
#[derive(Debug, Clone)]
pub struct Participant {
    /// Unique id assigned by the server, used as owner id in every registry
    pub id: OwnerId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Name shown next to the participant's reservations
    pub display_name: String,
    /// Last time we received any packet from this participant
    pub last_seen: Instant,
}

impl Participant {
    pub fn new(id: OwnerId, addr: SocketAddr, display_name: String) -> Self {
        Self {
            id,
            addr,
            display_name,
            last_seen: Instant::now(),
        }
    }

    /// Returns true if nothing has been heard from this participant within
    /// the given timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Trims a requested display name, caps its encoded length in bytes and falls
/// back to a generated one when empty
pub fn sanitize_display_name(requested: &str, id: OwnerId) -> String {
    let mut name = String::new();
    for c in requested.trim().chars().filter(|c| !c.is_control()) {
        if name.len() + c.len_utf8() > MAX_DISPLAY_NAME_LEN {
            break;
        }
        name.push(c);
    }

    if name.is_empty() {
        format!("Player {}", id)
    } else {
        name
    }
}

/// Manages all connected participants
pub struct ParticipantManager {
    participants: HashMap<OwnerId, Participant>,
    next_id: OwnerId,
    max_participants: usize,
}

impl ParticipantManager {
    /// Creates an empty roster with the given capacity. Ids start from 1.
    pub fn new(max_participants: usize) -> Self {
        Self {
            participants: HashMap::new(),
            next_id: 1,
            max_participants,
        }
    }

    /// Admits a new participant.
    ///
    /// Returns `None` if the server is at capacity. Ids are never reused
    /// within a session, so a late packet from a departed participant can
    /// never be attributed to a newcomer.
    pub fn add(&mut self, addr: SocketAddr, requested_name: &str) -> Option<&Participant> {
        if self.participants.len() >= self.max_participants {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        let participant = Participant::new(id, addr, sanitize_display_name(requested_name, id));
        info!(
            "Participant {} ({}) connected from {}",
            id, participant.display_name, addr
        );
        self.participants.insert(id, participant);
        self.participants.get(&id)
    }

    /// Removes a participant, returning it if it was still present
    pub fn remove(&mut self, id: OwnerId) -> Option<Participant> {
        let removed = self.participants.remove(&id);
        if let Some(participant) = &removed {
            info!(
                "Participant {} ({}) disconnected",
                participant.id, participant.display_name
            );
        }
        removed
    }

    pub fn get(&self, id: OwnerId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    /// Finds the participant sending from the given address
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&Participant> {
        self.participants.values().find(|p| p.addr == addr)
    }

    /// Refreshes the liveness timestamp of the participant at `addr`
    pub fn touch(&mut self, addr: SocketAddr) -> bool {
        match self.participants.values_mut().find(|p| p.addr == addr) {
            Some(participant) => {
                participant.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Ids of participants that have been silent longer than `timeout`.
    /// Nothing is removed here; the caller runs the disconnect path.
    pub fn timed_out(&self, timeout: Duration) -> Vec<OwnerId> {
        let mut ids: Vec<OwnerId> = self
            .participants
            .values()
            .filter(|p| p.is_timed_out(timeout))
            .map(|p| p.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Addresses of every connected participant, for broadcasts
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.participants.values().map(|p| p.addr).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
