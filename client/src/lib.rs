//! # Reservation Client Library
//!
//! This library provides the client side of the reservation protocol. A client
//! connects to the server, keeps a read-only mirror of every registry, and asks
//! the server for resources. It never decides ownership itself.
//!
//! ## Architecture Overview
//!
//! ### Mirrors
//! Each registry is mirrored from a snapshot delivered on join, followed by the
//! server's revision-numbered batches. A missing batch marks the mirror out of
//! sync and the client asks for a fresh snapshot. Until a mirror has its first
//! snapshot it is not ready and ignores updates.
//!
//! ### Requests
//! A claim is a request, not an action. The client keeps at most one claim in
//! flight per (registry, resource) pair and completes it when the server's
//! result arrives. The local mirror only changes when the server broadcasts.
//!
//! ## Module Organization
//!
//! - `mirror`: per-registry mirrors and change notification
//! - `pending`: outstanding claims awaiting a result
//! - `network`: socket handling, the receive loop and the public [`network::Client`]
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientOptions};
//! use shared::RegistryKind;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect("127.0.0.1:8080", "Ada", ClientOptions::default()).await?;
//!     client.wait_ready().await?;
//!
//!     let response = client.claim(RegistryKind::ColorSlot, 2).await?;
//!     println!("claim granted: {}", response.is_granted());
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod mirror;
pub mod network;
pub mod pending;
