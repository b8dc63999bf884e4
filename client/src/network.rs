use crate::mirror::{RegistryMirror, UpdateOutcome};
use crate::pending::{ClaimResponse, PendingClaims};
use bincode::{deserialize, serialize};
use log::{debug, info, warn};
use shared::{
    timestamp_ms, OwnerId, Packet, RegistryKind, RejectReason, ResourceId, HEARTBEAT_INTERVAL_MS,
    MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode packet: {0}")]
    Codec(#[from] bincode::Error),
    #[error("invalid server address: {0}")]
    Address(#[from] std::net::AddrParseError),
    #[error("server refused the connection: {0}")]
    Refused(String),
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("a claim for {registry} {resource_id} is already pending")]
    AlreadyPending {
        registry: RegistryKind,
        resource_id: ResourceId,
    },
    #[error("connection to the server is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Simulated round-trip latency, split between send and receive
    pub fake_ping_ms: u64,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            fake_ping_ms: 0,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Client state shared between the public handle and the receive task
struct ClientState {
    connected: bool,
    mirrors: BTreeMap<RegistryKind, RegistryMirror>,
    pending: PendingClaims,
    ready_tx: watch::Sender<bool>,
}

impl ClientState {
    fn new(ready_tx: watch::Sender<bool>) -> Self {
        Self {
            connected: true,
            mirrors: RegistryKind::ALL
                .iter()
                .map(|kind| (*kind, RegistryMirror::new(*kind)))
                .collect(),
            pending: PendingClaims::new(),
            ready_tx,
        }
    }

    /// Applies a packet from the server. Returns packets to send back.
    fn handle_packet(&mut self, packet: Packet) -> Vec<Packet> {
        match packet {
            Packet::Snapshot {
                registry,
                owners,
                labels,
            } => {
                if let Some(mirror) = self.mirrors.get_mut(&registry) {
                    mirror.apply_snapshot(&owners, &labels);
                }
                if self.mirrors.values().all(RegistryMirror::is_ready) {
                    self.ready_tx.send_replace(true);
                }
                Vec::new()
            }

            Packet::RegistryUpdate {
                registry,
                owners,
                labels,
            } => {
                let Some(mirror) = self.mirrors.get_mut(&registry) else {
                    return Vec::new();
                };
                match mirror.apply_update(owners.as_ref(), labels.as_ref()) {
                    UpdateOutcome::OutOfSync if mirror.should_request_sync(Instant::now()) => {
                        debug!("{} mirror out of sync, requesting snapshot", registry);
                        vec![Packet::SyncRequest { registry }]
                    }
                    _ => Vec::new(),
                }
            }

            Packet::ClaimResult {
                registry,
                resource_id,
                ok,
                reason,
                payload,
            } => {
                let response = ClaimResponse::from_result(ok, reason, payload);
                if response == ClaimResponse::Unexplained {
                    warn!(
                        "Server refused {} {} without a reason",
                        registry, resource_id
                    );
                }
                if !self.pending.resolve(registry, resource_id, response) {
                    debug!(
                        "Result for {} {} arrived after the request was abandoned",
                        registry, resource_id
                    );
                }
                Vec::new()
            }

            Packet::ReleaseResult {
                registry,
                resource_id,
                ok,
                reason,
            } => {
                match (ok, reason) {
                    (true, _) => debug!("Released {} {}", registry, resource_id),
                    (false, Some(RejectReason::UnknownResource)) => {
                        warn!("Server does not know {} {}", registry, resource_id)
                    }
                    (false, reason) => debug!(
                        "Release of {} {} refused: {:?}",
                        registry, resource_id, reason
                    ),
                }
                Vec::new()
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.pending.clear();
                Vec::new()
            }

            Packet::Connected { client_id } => {
                debug!("Duplicate connect acknowledgement for {}", client_id);
                Vec::new()
            }

            _ => {
                warn!("Unexpected packet type");
                Vec::new()
            }
        }
    }
}

/// A connected participant
pub struct Client {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    client_id: OwnerId,
    options: ClientOptions,
    state: Arc<Mutex<ClientState>>,
    ready_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Connects to the server and waits for the connection to be accepted
    pub async fn connect(
        server_addr: &str,
        display_name: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let server_addr: SocketAddr = server_addr.parse()?;

        let (ready_tx, ready_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(ClientState::new(ready_tx)));

        info!("Connecting to {}...", server_addr);
        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            display_name: display_name.to_string(),
        };
        send_packet(&socket, server_addr, options.fake_ping_ms, &packet).await?;

        let client_id = timeout(
            options.connect_timeout,
            Self::await_accept(&socket, server_addr, &state),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        info!("Connected! Client ID: {}", client_id);

        let mut client = Client {
            socket,
            server_addr,
            client_id,
            options,
            state,
            ready_rx,
            tasks: Vec::new(),
        };
        client.spawn_receiver();
        client.spawn_heartbeat();
        Ok(client)
    }

    /// Reads packets until the server accepts or refuses us. Anything else
    /// that arrives first is applied to the state as usual.
    async fn await_accept(
        socket: &UdpSocket,
        server_addr: SocketAddr,
        state: &Mutex<ClientState>,
    ) -> Result<OwnerId, ClientError> {
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            let (len, from) = socket.recv_from(&mut buffer).await?;
            if from != server_addr {
                continue;
            }

            let packet = match deserialize::<Packet>(&buffer[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Failed to deserialize packet: {}", e);
                    continue;
                }
            };

            match packet {
                Packet::Connected { client_id } => return Ok(client_id),
                Packet::Disconnected { reason } => return Err(ClientError::Refused(reason)),
                other => {
                    lock(state).handle_packet(other);
                }
            }
        }
    }

    fn spawn_receiver(&mut self) {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let server_addr = self.server_addr;
        let fake_ping_ms = self.options.fake_ping_ms;

        self.tasks.push(tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE];

            loop {
                let (len, from) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("Error receiving packet: {}", e);
                        sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };
                if from != server_addr {
                    continue;
                }

                if fake_ping_ms > 0 {
                    sleep(Duration::from_millis(fake_ping_ms / 2)).await;
                }

                let packet = match deserialize::<Packet>(&buffer[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Failed to deserialize packet: {}", e);
                        continue;
                    }
                };

                let (replies, connected) = {
                    let mut state = lock(&state);
                    let replies = state.handle_packet(packet);
                    (replies, state.connected)
                };

                for reply in replies {
                    if let Err(e) = send_packet(&socket, server_addr, fake_ping_ms, &reply).await {
                        warn!("Failed to send packet: {}", e);
                    }
                }

                if !connected {
                    break;
                }
            }
        }));
    }

    fn spawn_heartbeat(&mut self) {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let server_addr = self.server_addr;
        let fake_ping_ms = self.options.fake_ping_ms;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
            loop {
                ticker.tick().await;
                if !lock(&state).connected {
                    debug!("No longer connected, stopping heartbeat");
                    break;
                }
                let packet = Packet::Heartbeat {
                    timestamp: timestamp_ms(),
                };
                if let Err(e) = send_packet(&socket, server_addr, fake_ping_ms, &packet).await {
                    warn!("Failed to send heartbeat: {}", e);
                }
            }
        }));
    }

    pub fn client_id(&self) -> OwnerId {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Resolves once every registry has received its first snapshot
    pub async fn wait_ready(&self) -> Result<(), ClientError> {
        let mut ready_rx = self.ready_rx.clone();
        let wait = async { ready_rx.wait_for(|ready| *ready).await.map(|_| ()) };
        let result = match timeout(self.options.connect_timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        };
        result
    }

    /// Asks the server for a resource and waits for its answer.
    ///
    /// A claim for a pair that already has one in flight is not sent and
    /// fails with [`ClientError::AlreadyPending`]. Local state is never
    /// changed optimistically; the mirror updates when the server broadcasts.
    pub async fn claim(
        &self,
        registry: RegistryKind,
        resource_id: ResourceId,
    ) -> Result<ClaimResponse, ClientError> {
        let response_rx = {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(ClientError::Closed);
            }
            state
                .pending
                .begin(registry, resource_id)
                .ok_or(ClientError::AlreadyPending {
                    registry,
                    resource_id,
                })?
        };

        let request = Packet::ClaimRequest {
            registry,
            resource_id,
        };
        if let Err(e) = self.send(&request).await {
            drop(response_rx);
            lock(&self.state).pending.cancel(registry, resource_id);
            return Err(e);
        }

        match timeout(self.options.request_timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                lock(&self.state).pending.cancel(registry, resource_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Gives a resource back. The mirror reflects it once the server
    /// broadcasts the change.
    pub async fn release(
        &self,
        registry: RegistryKind,
        resource_id: ResourceId,
    ) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Closed);
        }
        self.send(&Packet::ReleaseRequest {
            registry,
            resource_id,
        })
        .await
    }

    /// Runs `f` against the mirror of one registry
    pub fn with_registry<R>(
        &self,
        registry: RegistryKind,
        f: impl FnOnce(&RegistryMirror) -> R,
    ) -> Option<R> {
        lock(&self.state).mirrors.get(&registry).map(f)
    }

    /// Registers a callback fired whenever the registry's mirror changes.
    ///
    /// Callbacks run on the receive task with the client state locked and
    /// must not call back into the client.
    pub fn on_registry_changed<F>(&self, registry: RegistryKind, callback: F)
    where
        F: FnMut(&RegistryMirror) + Send + 'static,
    {
        if let Some(mirror) = lock(&self.state).mirrors.get_mut(&registry) {
            mirror.on_changed(callback);
        }
    }

    /// The resource this client holds in a registry, as last seen
    pub fn my_resource(&self, registry: RegistryKind) -> Option<ResourceId> {
        let client_id = self.client_id;
        self.with_registry(registry, |mirror| mirror.find_resource_owned_by(client_id))
            .flatten()
    }

    /// Mirrored reservations of a registry
    pub fn reservations(&self, registry: RegistryKind) -> BTreeMap<ResourceId, OwnerId> {
        self.with_registry(registry, RegistryMirror::reservations)
            .unwrap_or_default()
    }

    /// Leaves the session. The server releases everything we held.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        let was_connected = {
            let mut state = lock(&self.state);
            let was_connected = state.connected;
            state.connected = false;
            state.pending.clear();
            was_connected
        };

        if was_connected {
            self.send(&Packet::Disconnect).await?;
        }
        self.stop_tasks();
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<(), ClientError> {
        send_packet(&self.socket, self.server_addr, self.options.fake_ping_ms, packet).await
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

async fn send_packet(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    fake_ping_ms: u64,
    packet: &Packet,
) -> Result<(), ClientError> {
    if fake_ping_ms > 0 {
        sleep(Duration::from_millis(fake_ping_ms / 2)).await;
    }

    let data = serialize(packet)?;
    socket.send_to(&data, server_addr).await?;
    Ok(())
}

fn lock(state: &Mutex<ClientState>) -> MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
