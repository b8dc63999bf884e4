//! Authoritative session state and packet dispatch
//!
//! The session is the single writer of all reservation state. The network
//! layer feeds it one packet at a time and forwards whatever [`Outbound`]
//! messages it returns, in order. Because nothing else mutates the
//! registries, each request's check and write happen without interleaving.

use crate::claims::{process_claim, process_release, ClaimReply};
use crate::config::ServerConfig;
use crate::lifecycle;
use crate::participants::ParticipantManager;
use crate::registry::{RegistryDelta, Reservations};
use log::{debug, info, warn};
use shared::{OwnerId, Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;

/// Messages the network layer should send
#[derive(Debug)]
pub enum Outbound {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        recipients: Vec<SocketAddr>,
    },
}

pub struct Session {
    participants: ParticipantManager,
    reservations: Reservations,
    client_timeout: Duration,
}

impl Session {
    pub fn new(config: &ServerConfig) -> Self {
        let mut reservations = Reservations::new(config.catalogs());
        for registry in reservations.iter_mut() {
            registry.subscribe(|delta| {
                debug!(
                    "{} registry committed owners rev {:?}, labels rev {:?}",
                    delta.registry,
                    delta.owners.as_ref().map(|b| b.revision),
                    delta.labels.as_ref().map(|b| b.revision)
                )
            });
        }

        Self {
            participants: ParticipantManager::new(config.max_clients),
            reservations,
            client_timeout: config.client_timeout,
        }
    }

    pub fn participants(&self) -> &ParticipantManager {
        &self.participants
    }

    pub fn reservations(&self) -> &Reservations {
        &self.reservations
    }

    /// Processes one packet received from `addr`
    pub fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) -> Vec<Outbound> {
        self.participants.touch(addr);

        match packet {
            Packet::Connect {
                client_version,
                display_name,
            } => self.connect(addr, client_version, &display_name),

            Packet::Heartbeat { .. } => Vec::new(),

            Packet::ClaimRequest {
                registry,
                resource_id,
            } => {
                let reply = process_claim(
                    &self.participants,
                    &mut self.reservations,
                    addr,
                    registry,
                    resource_id,
                );
                self.reply(reply, addr)
            }

            Packet::ReleaseRequest {
                registry,
                resource_id,
            } => {
                let reply = process_release(
                    &self.participants,
                    &mut self.reservations,
                    addr,
                    registry,
                    resource_id,
                );
                self.reply(reply, addr)
            }

            Packet::SyncRequest { registry } => {
                if self.participants.find_by_addr(addr).is_none() {
                    debug!("Ignoring sync request from unknown address {}", addr);
                    return Vec::new();
                }
                match self.reservations.get(registry) {
                    Some(r) => {
                        debug!("Resending {} snapshot to {}", registry, addr);
                        vec![Outbound::SendPacket {
                            packet: r.snapshot_packet(),
                            addr,
                        }]
                    }
                    None => {
                        warn!("Sync requested for unconfigured registry {}", registry);
                        Vec::new()
                    }
                }
            }

            Packet::Disconnect => match self.participants.find_by_addr(addr) {
                Some(participant) => {
                    let id = participant.id;
                    self.disconnect(id)
                }
                None => Vec::new(),
            },

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
                Vec::new()
            }
        }
    }

    /// Runs the disconnect path for `owner`. Repeated calls are harmless.
    pub fn disconnect(&mut self, owner: OwnerId) -> Vec<Outbound> {
        let (_, deltas) =
            lifecycle::disconnect(&mut self.participants, &mut self.reservations, owner);
        self.broadcast_deltas(deltas)
    }

    /// Disconnects every participant that has gone silent
    pub fn expire_stale(&mut self) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for owner in self.participants.timed_out(self.client_timeout) {
            info!("Participant {} timed out", owner);
            if let Some(participant) = self.participants.get(owner) {
                outbound.push(Outbound::SendPacket {
                    packet: Packet::Disconnected {
                        reason: "Timed out".to_string(),
                    },
                    addr: participant.addr,
                });
            }
            outbound.extend(self.disconnect(owner));
        }
        outbound
    }

    fn connect(&mut self, addr: SocketAddr, client_version: u32, name: &str) -> Vec<Outbound> {
        if client_version != PROTOCOL_VERSION {
            warn!(
                "Rejecting {}: protocol version {} (expected {})",
                addr, client_version, PROTOCOL_VERSION
            );
            return vec![Outbound::SendPacket {
                packet: Packet::Disconnected {
                    reason: "Protocol version mismatch".to_string(),
                },
                addr,
            }];
        }

        let mut outbound = Vec::new();

        // A reconnect from the same address replaces the old participant
        if let Some(existing) = self.participants.find_by_addr(addr) {
            let id = existing.id;
            info!("Removing existing participant {} from {}", id, addr);
            outbound.extend(self.disconnect(id));
        }

        match self.participants.add(addr, name) {
            Some(participant) => {
                let welcome = lifecycle::welcome_packets(participant, &self.reservations);
                outbound.extend(
                    welcome
                        .into_iter()
                        .map(|packet| Outbound::SendPacket { packet, addr }),
                );
            }
            None => {
                warn!("Rejecting {}: server full", addr);
                outbound.push(Outbound::SendPacket {
                    packet: Packet::Disconnected {
                        reason: "Server full".to_string(),
                    },
                    addr,
                });
            }
        }
        outbound
    }

    fn reply(&self, reply: ClaimReply, addr: SocketAddr) -> Vec<Outbound> {
        let mut outbound = self.broadcast_deltas(reply.delta);
        outbound.push(Outbound::SendPacket {
            packet: reply.response,
            addr,
        });
        outbound
    }

    fn broadcast_deltas(&self, deltas: impl IntoIterator<Item = RegistryDelta>) -> Vec<Outbound> {
        let recipients = self.participants.addrs();
        deltas
            .into_iter()
            .map(|delta| Outbound::BroadcastPacket {
                packet: delta.into_packet(),
                recipients: recipients.clone(),
            })
            .collect()
    }
}
