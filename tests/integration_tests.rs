//! Integration tests for the reservation protocol
//!
//! These tests run a real server on an ephemeral port and drive it with real
//! clients over UDP.

use assert_approx_eq::assert_approx_eq;
use client::network::{Client, ClientError, ClientOptions};
use client::pending::ClaimResponse;
use server::config::ServerConfig;
use server::network::{Server, ShutdownHandle};
use shared::{RegistryKind, RejectReason, ResourcePayload};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

async fn start_server(config: ServerConfig) -> (SocketAddr, ShutdownHandle) {
    let mut server = Server::new(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..config
    })
    .await
    .expect("Failed to start server");

    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    (addr, shutdown)
}

async fn join(addr: SocketAddr, name: &str) -> Client {
    join_with(addr, name, ClientOptions::default()).await
}

async fn join_with(addr: SocketAddr, name: &str, options: ClientOptions) -> Client {
    let client = Client::connect(&addr.to_string(), name, options)
        .await
        .expect("Failed to connect");
    client.wait_ready().await.expect("Mirrors never became ready");
    client
}

/// Polls `condition` until it holds or two seconds pass
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// CLAIM PROTOCOL TESTS
mod claim_tests {
    use super::*;

    /// Two players racing for one resource: exactly one wins
    #[tokio::test]
    async fn concurrent_claims_have_single_winner() {
        let (addr, shutdown) = start_server(ServerConfig::default()).await;
        let alice = join(addr, "Alice").await;
        let bob = join(addr, "Bob").await;

        let (a, b) = tokio::join!(
            alice.claim(RegistryKind::ColorSlot, 3),
            bob.claim(RegistryKind::ColorSlot, 3)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.is_granted(), b.is_granted());
        let (winner, loser_response) = if a.is_granted() {
            (alice.client_id(), b)
        } else {
            (bob.client_id(), a)
        };
        assert_eq!(
            loser_response,
            ClaimResponse::Rejected(RejectReason::AlreadyTaken)
        );

        assert!(
            eventually(|| {
                alice.reservations(RegistryKind::ColorSlot).get(&3) == Some(&winner)
                    && bob.reservations(RegistryKind::ColorSlot).get(&3) == Some(&winner)
            })
            .await
        );

        shutdown.shutdown();
    }

    /// The grant carries the resource payload
    #[tokio::test]
    async fn granted_claim_returns_payload() {
        let (addr, shutdown) = start_server(ServerConfig::default()).await;
        let alice = join(addr, "Alice").await;

        let response = alice.claim(RegistryKind::BoardSpot, 0).await.unwrap();
        match response {
            ClaimResponse::Granted(Some(ResourcePayload::Position { x, y })) => {
                assert_approx_eq!(x, 0.0, 1e-3);
                assert_approx_eq!(y, -220.0, 1e-3);
            }
            other => panic!("Unexpected response: {:?}", other),
        }

        let response = alice.claim(RegistryKind::ColorSlot, 1).await.unwrap();
        assert!(matches!(
            response,
            ClaimResponse::Granted(Some(ResourcePayload::Color { .. }))
        ));
        assert_eq!(alice.my_resource(RegistryKind::ColorSlot), Some(1));

        shutdown.shutdown();
    }

    /// Switching resources never shows the owner holding zero or two
    #[tokio::test]
    async fn swap_is_observed_atomically() {
        let (addr, shutdown) = start_server(ServerConfig::default()).await;
        let alice = join(addr, "Alice").await;
        let bob = join(addr, "Bob").await;
        let alice_id = alice.client_id();

        assert!(alice
            .claim(RegistryKind::BoardSpot, 0)
            .await
            .unwrap()
            .is_granted());
        assert!(
            eventually(|| bob.reservations(RegistryKind::BoardSpot).get(&0) == Some(&alice_id))
                .await
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bob.on_registry_changed(RegistryKind::BoardSpot, move |mirror| {
            let held: Vec<_> = mirror
                .reservations()
                .into_iter()
                .filter(|(_, owner)| *owner == alice_id)
                .map(|(resource_id, _)| resource_id)
                .collect();
            sink.lock().unwrap().push(held);
        });

        assert!(alice
            .claim(RegistryKind::BoardSpot, 5)
            .await
            .unwrap()
            .is_granted());
        assert!(
            eventually(|| bob.reservations(RegistryKind::BoardSpot).get(&5) == Some(&alice_id))
                .await
        );

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|held| held.len() == 1));
        assert_eq!(seen.last(), Some(&vec![5]));

        shutdown.shutdown();
    }

    /// A second claim for a pair already in flight is never sent
    #[tokio::test]
    async fn duplicate_claim_while_pending() {
        let (addr, shutdown) = start_server(ServerConfig::default()).await;
        let options = ClientOptions {
            fake_ping_ms: 200,
            ..ClientOptions::default()
        };
        let alice = join_with(addr, "Alice", options).await;

        let (first, second) = tokio::join!(
            alice.claim(RegistryKind::ColorSlot, 2),
            alice.claim(RegistryKind::ColorSlot, 2)
        );

        assert!(first.unwrap().is_granted());
        assert!(matches!(
            second,
            Err(ClientError::AlreadyPending {
                registry: RegistryKind::ColorSlot,
                resource_id: 2
            })
        ));

        shutdown.shutdown();
    }

    #[tokio::test]
    async fn unknown_resource_rejected() {
        let (addr, shutdown) = start_server(ServerConfig::default()).await;
        let alice = join(addr, "Alice").await;

        let response = alice.claim(RegistryKind::ColorSlot, 99).await.unwrap();
        assert_eq!(
            response,
            ClaimResponse::Rejected(RejectReason::UnknownResource)
        );
        assert!(alice.reservations(RegistryKind::ColorSlot).is_empty());

        shutdown.shutdown();
    }

    /// Only the holder can release
    #[tokio::test]
    async fn release_by_non_owner_ignored() {
        let (addr, shutdown) = start_server(ServerConfig::default()).await;
        let alice = join(addr, "Alice").await;
        let bob = join(addr, "Bob").await;
        let alice_id = alice.client_id();

        assert!(alice
            .claim(RegistryKind::ColorSlot, 4)
            .await
            .unwrap()
            .is_granted());

        bob.release(RegistryKind::ColorSlot, 4).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            alice.reservations(RegistryKind::ColorSlot).get(&4),
            Some(&alice_id)
        );

        alice.release(RegistryKind::ColorSlot, 4).await.unwrap();
        assert!(eventually(|| bob.reservations(RegistryKind::ColorSlot).is_empty()).await);

        shutdown.shutdown();
    }
}

/// PARTICIPANT LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;
    use bincode::{deserialize, serialize};
    use shared::{Packet, MAX_PACKET_SIZE, PROTOCOL_VERSION};
    use tokio::net::UdpSocket;

    /// A late joiner sees the same state as everyone else
    #[tokio::test]
    async fn late_joiner_matches_existing_state() {
        let (addr, shutdown) = start_server(ServerConfig::default()).await;
        let alice = join(addr, "Alice").await;
        let bob = join(addr, "Bob").await;

        assert!(alice
            .claim(RegistryKind::ColorSlot, 1)
            .await
            .unwrap()
            .is_granted());
        assert!(alice
            .claim(RegistryKind::BoardSpot, 2)
            .await
            .unwrap()
            .is_granted());
        assert!(bob
            .claim(RegistryKind::ColorSlot, 0)
            .await
            .unwrap()
            .is_granted());

        let carol = join(addr, "Carol").await;
        for registry in RegistryKind::ALL {
            assert_eq!(
                carol.reservations(registry),
                alice.reservations(registry),
                "{} registry differs for late joiner",
                registry
            );
        }
        let label = carol.with_registry(RegistryKind::ColorSlot, |mirror| {
            mirror.label_of(1).map(str::to_string)
        });
        assert_eq!(label.flatten().as_deref(), Some("Alice"));

        shutdown.shutdown();
    }

    /// Leaving frees everything the player held
    #[tokio::test]
    async fn disconnect_releases_reservations() {
        let (addr, shutdown) = start_server(ServerConfig::default()).await;
        let alice = join(addr, "Alice").await;
        let bob = join(addr, "Bob").await;

        assert!(alice
            .claim(RegistryKind::ColorSlot, 4)
            .await
            .unwrap()
            .is_granted());
        assert!(alice
            .claim(RegistryKind::BoardSpot, 7)
            .await
            .unwrap()
            .is_granted());

        alice.disconnect().await.unwrap();

        assert!(
            eventually(|| {
                bob.reservations(RegistryKind::ColorSlot).is_empty()
                    && bob.reservations(RegistryKind::BoardSpot).is_empty()
            })
            .await
        );

        let response = bob.claim(RegistryKind::ColorSlot, 4).await.unwrap();
        assert!(response.is_granted());

        shutdown.shutdown();
    }

    /// A participant that goes silent is expired and its reservation freed
    #[tokio::test]
    async fn silent_participant_times_out() {
        let config = ServerConfig {
            client_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(100),
            ..ServerConfig::default()
        };
        let (addr, shutdown) = start_server(config).await;
        let bob = join(addr, "Bob").await;

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            display_name: "Ghost".to_string(),
        };
        raw.send_to(&serialize(&connect).unwrap(), addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = raw.recv_from(&mut buf).await.unwrap();
        let ghost_id = match deserialize::<Packet>(&buf[..len]).unwrap() {
            Packet::Connected { client_id } => client_id,
            other => panic!("Expected Connected, got {:?}", other),
        };

        let claim = Packet::ClaimRequest {
            registry: RegistryKind::ColorSlot,
            resource_id: 0,
        };
        raw.send_to(&serialize(&claim).unwrap(), addr)
            .await
            .unwrap();

        assert!(
            eventually(|| bob.reservations(RegistryKind::ColorSlot).get(&0) == Some(&ghost_id))
                .await
        );

        let mut freed = false;
        for _ in 0..30 {
            sleep(Duration::from_millis(200)).await;
            if bob.reservations(RegistryKind::ColorSlot).is_empty() {
                freed = true;
                break;
            }
        }
        assert!(freed, "Silent participant's reservation was never released");
        assert!(bob.is_connected());

        shutdown.shutdown();
    }

    #[tokio::test]
    async fn full_server_refuses_connection() {
        let config = ServerConfig {
            max_clients: 1,
            ..ServerConfig::default()
        };
        let (addr, shutdown) = start_server(config).await;
        let _alice = join(addr, "Alice").await;

        let result = Client::connect(&addr.to_string(), "Bob", ClientOptions::default()).await;
        assert!(matches!(result, Err(ClientError::Refused(_))));

        shutdown.shutdown();
    }

    /// Malformed datagrams are dropped without disturbing the session
    #[tokio::test]
    async fn malformed_packet_is_ignored() {
        let (addr, shutdown) = start_server(ServerConfig::default()).await;
        let alice = join(addr, "Alice").await;

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[0xff, 0x00, 0x13, 0x37], addr).await.unwrap();

        let response = alice.claim(RegistryKind::BoardSpot, 3).await.unwrap();
        assert!(response.is_granted());

        let bob = join(addr, "Bob").await;
        assert_eq!(
            bob.reservations(RegistryKind::BoardSpot).get(&3),
            Some(&alice.client_id())
        );

        shutdown.shutdown();
    }
}
