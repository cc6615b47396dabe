//! Correlation registry: the in-process map from request ID to the single waiter
//! that is blocked on the matching result.
//!
//! A registry is constructed once per requester process and shared by reference
//! between the callers issuing requests and the broadcast listener delivering results.

use crate::message::InquiryResponse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::oneshot;
use tracing::debug;

/// Identifies one registration, so cleanup of an old waiter never evicts a newer one.
pub type WaiterToken = u64;

struct Slot {
    token: WaiterToken,
    sender: oneshot::Sender<InquiryResponse>,
}

/// Receiving end of a capacity-one delivery slot.
#[derive(Debug)]
pub struct WaiterHandle {
    id: String,
    token: WaiterToken,
    receiver: oneshot::Receiver<InquiryResponse>,
}

/// The slot was dropped without a result, because a newer registration replaced it.
#[derive(Debug, PartialEq, Eq)]
pub struct WaiterClosed;

impl WaiterHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> WaiterToken {
        self.token
    }

    /// Waits for the result. Does not time out on its own.
    pub async fn recv(self) -> Result<InquiryResponse, WaiterClosed> {
        self.receiver.await.map_err(|_| WaiterClosed)
    }
}

#[derive(Default)]
pub struct CorrelationRegistry {
    waiters: RwLock<HashMap<String, Slot>>,
    next_token: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // The map holds no invariant a panicking holder could break halfway.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.waiters.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.waiters.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a fresh waiter for `id`. Last registration wins: a previous waiter for
    /// the same ID is dropped and its handle resolves with [`WaiterClosed`].
    pub fn register(&self, id: &str) -> WaiterHandle {
        let (sender, receiver) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let replaced = self
            .write()
            .insert(id.to_string(), Slot { token, sender })
            .is_some();

        if replaced {
            debug!(id, "Replaced existing waiter");
        }

        WaiterHandle {
            id: id.to_string(),
            token,
            receiver,
        }
    }

    /// Hands `response` to the waiter registered for `id` and removes it.
    ///
    /// Returns `false` when nobody is waiting (never registered, already delivered,
    /// discarded, or the caller already gave up); the response is dropped.
    pub fn deliver(&self, id: &str, response: InquiryResponse) -> bool {
        let slot = self.write().remove(id);

        match slot {
            Some(slot) => slot.sender.send(response).is_ok(),
            None => false,
        }
    }

    /// Removes the entry for `id` if it still belongs to the registration `token`.
    pub fn discard(&self, id: &str, token: WaiterToken) -> bool {
        let mut waiters = self.write();
        match waiters.get(id) {
            Some(slot) if slot.token == token => {
                waiters.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn is_waiting(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
