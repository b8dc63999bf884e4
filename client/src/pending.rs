//! Outstanding claim requests
//!
//! Each (registry, resource) pair is either idle or has exactly one claim in
//! flight. Starting a claim hands back a one-shot receiver that completes when
//! the server's `ClaimResult` for that pair arrives.

use shared::{RegistryKind, RejectReason, ResourceId, ResourcePayload};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// The server's answer to a claim
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResponse {
    Granted(Option<ResourcePayload>),
    Rejected(RejectReason),
    /// Refused without a reason, which a well-behaved server never sends
    Unexplained,
}

impl ClaimResponse {
    pub fn from_result(
        ok: bool,
        reason: Option<RejectReason>,
        payload: Option<ResourcePayload>,
    ) -> Self {
        match (ok, reason) {
            (true, _) => ClaimResponse::Granted(payload),
            (false, Some(reason)) => ClaimResponse::Rejected(reason),
            (false, None) => ClaimResponse::Unexplained,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimResponse::Granted(_))
    }
}

#[derive(Debug, Default)]
pub struct PendingClaims {
    pending: HashMap<(RegistryKind, ResourceId), oneshot::Sender<ClaimResponse>>,
}

impl PendingClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the pair to pending. Returns `None` if a claim for it is already
    /// in flight, in which case the new request must not be sent.
    pub fn begin(
        &mut self,
        registry: RegistryKind,
        resource_id: ResourceId,
    ) -> Option<oneshot::Receiver<ClaimResponse>> {
        let key = (registry, resource_id);
        if self.pending.get(&key).is_some_and(|tx| !tx.is_closed()) {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(key, tx);
        Some(rx)
    }

    /// Delivers a response and moves the pair back to idle. Returns false if
    /// nothing was waiting for it.
    pub fn resolve(
        &mut self,
        registry: RegistryKind,
        resource_id: ResourceId,
        response: ClaimResponse,
    ) -> bool {
        match self.pending.remove(&(registry, resource_id)) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Clears a pair whose waiter has gone away. A claim that took the pair
    /// over in the meantime is left in place.
    pub fn cancel(&mut self, registry: RegistryKind, resource_id: ResourceId) {
        let key = (registry, resource_id);
        if self.pending.get(&key).is_some_and(|tx| tx.is_closed()) {
            self.pending.remove(&key);
        }
    }

    /// Drops every waiter; their receivers fail with a closed-channel error
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
