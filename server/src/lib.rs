//! # Reservation Server Library
//!
//! This library provides the authoritative server for shared, exclusive game
//! resources: color choices and board spots. Connected players claim and
//! release them; the server decides, and every client mirrors the outcome.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Assignment
//! The server is the only process that writes reservation state. Clients send
//! requests and receive both a direct answer and the resulting change through
//! the replicated registry maps.
//!
//! ### Participant Management
//! Handles the lifecycle of connected players:
//! - Admission, capacity limits and protocol version checks
//! - Resolving each request's sender to a participant
//! - Timeout detection for players that silently went away
//! - Releasing every reservation a departing player held
//!
//! ### State Replication
//! Every committed change is broadcast as one batch per registry operation.
//! A joining player receives a snapshot of each registry before any other
//! traffic, so late joiners see the same state as everyone else.
//!
//! ## Architecture Design
//!
//! ### Single Writer
//! All packets are handled one at a time by one task that owns the
//! [`session::Session`]. The uniqueness check and the write of a claim can
//! therefore never interleave with another request, and a disconnect is
//! never undone by a late claim from the same connection.
//!
//! ### UDP-Based Communication
//! Packets are `bincode`-encoded datagrams. Replicated batches carry revision
//! numbers so clients detect loss and ask for a fresh snapshot.
//!
//! ## Module Organization
//!
//! - `participants`: who is connected, by address and id
//! - `catalog`: the fixed set of resources and their payloads
//! - `registry`: per-class reservation maps and their invariants
//! - `claims`: claim/release request handling and rejection reasons
//! - `lifecycle`: welcome snapshots and release-on-disconnect
//! - `session`: packet dispatch tying the above together
//! - `config`: validated settings
//! - `network`: sockets, queues and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:8080".to_string(),
//!         ..ServerConfig::default()
//!     };
//!
//!     let mut server = Server::new(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod claims;
pub mod config;
pub mod lifecycle;
pub mod network;
pub mod participants;
pub mod registry;
pub mod session;
