//! Server network layer handling UDP communication and the session loop

use crate::config::ServerConfig;
use crate::session::{Outbound, Session};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    Shutdown,
}

/// Main server coordinating networking and the reservation session
pub struct Server {
    socket: Arc<UdpSocket>,
    session: Session,
    sweep_interval: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            session: Session::new(&config),
            sweep_interval: config.sweep_interval,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle that stops the loop started by [`Server::run`]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            server_tx: self.server_tx.clone(),
        }
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[0..len]) {
                        Ok(packet) => {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                debug!("Main loop gone, stopping receiver");
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to deserialize packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        // ICMP port-unreachable from a vanished client shows up here on some platforms
                        debug!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue in order
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    Outbound::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    Outbound::BroadcastPacket { packet, recipients } => {
                        let data = match serialize(&packet) {
                            Ok(data) => data,
                            Err(e) => {
                                error!("Failed to serialize broadcast: {}", e);
                                continue;
                            }
                        };
                        for addr in recipients {
                            if let Err(e) = socket.send_to(&data, addr).await {
                                error!("Failed to send to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn queue(&self, outbound: Vec<Outbound>) {
        for message in outbound {
            if let Err(e) = self.outbound_tx.send(message) {
                error!("Failed to queue packet for sending: {}", e);
            }
        }
    }

    /// Main server loop. Packets are handled strictly one at a time, which
    /// serializes every claim, release and disconnect.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            let outbound = self.session.handle_packet(packet, addr);
                            self.queue(outbound);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = sweep.tick() => {
                    let outbound = self.session.expire_stale();
                    self.queue(outbound);
                },
            }
        }

        Ok(())
    }
}

/// Cloneable handle used to stop a running [`Server`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.server_tx.send(ServerMessage::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{RegistryKind, PROTOCOL_VERSION};
    use tokio::time::timeout;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    async fn recv_packet(socket: &UdpSocket) -> Packet {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for server")
            .unwrap();
        deserialize(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ServerConfig {
            spots: 0,
            ..local_config()
        };
        assert!(Server::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_over_udp() {
        let mut server = Server::new(local_config()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(async move { server.run().await.map_err(|e| e.to_string()) });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = serialize(&Packet::Connect {
            client_version: PROTOCOL_VERSION,
            display_name: "Ada".to_string(),
        })
        .unwrap();
        socket.send_to(&connect, server_addr).await.unwrap();

        assert!(matches!(
            recv_packet(&socket).await,
            Packet::Connected { client_id: 1 }
        ));
        for kind in RegistryKind::ALL {
            match recv_packet(&socket).await {
                Packet::Snapshot { registry, owners, .. } => {
                    assert_eq!(registry, kind);
                    assert!(owners.entries.is_empty());
                }
                other => panic!("Unexpected packet: {:?}", other),
            }
        }

        shutdown.shutdown();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_garbage_datagram_does_not_stop_server() {
        let mut server = Server::new(local_config()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(async move { server.run().await.map_err(|e| e.to_string()) });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&[0xFF, 0x00, 0x13], server_addr).await.unwrap();

        let connect = serialize(&Packet::Connect {
            client_version: PROTOCOL_VERSION,
            display_name: "Ada".to_string(),
        })
        .unwrap();
        socket.send_to(&connect, server_addr).await.unwrap();
        assert!(matches!(
            recv_packet(&socket).await,
            Packet::Connected { .. }
        ));

        shutdown.shutdown();
        assert!(handle.await.unwrap().is_ok());
    }
}
