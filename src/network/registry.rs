//! Live session bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::session::{SessionError, SessionHandle, SessionResult};
use crate::protocol::{Origin, RawPacket};

/// Kick reason for a session whose send queue overflowed
pub const SLOW_CONSUMER_REASON: &str = "too slow to keep up";

/// Shared map of connected sessions, keyed by origin.
///
/// Handles are cloned out before sending so the lock is never held across
/// a network write. Sends through the registry never wait for queue space:
/// a session whose queue is full is kicked, so one stalled peer cannot hold
/// up delivery to everybody else.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Origin, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: SessionHandle) {
        self.sessions.write().await.insert(handle.origin(), handle);
    }

    pub async fn remove(&self, origin: Origin) -> Option<SessionHandle> {
        self.sessions.write().await.remove(&origin)
    }

    pub async fn get(&self, origin: Origin) -> Option<SessionHandle> {
        self.sessions.read().await.get(&origin).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Forget every session, returning how many were registered
    pub async fn clear(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        count
    }

    /// Pick the first id from `*next_id` on that no live session holds,
    /// wrapping back to 1 after `i32::MAX`, and advance `next_id` past it.
    /// Returns `None` only when every id is taken.
    pub async fn allocate_origin(&self, next_id: &mut i32) -> Option<Origin> {
        let sessions = self.sessions.read().await;
        // Among len + 1 candidates at least one is free
        for _ in 0..=sessions.len() {
            let candidate = Origin::from_int((*next_id).max(1));
            *next_id = candidate.to_int().checked_add(1).unwrap_or(1);
            if !sessions.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Send a packet to one session. A session whose queue is full is
    /// kicked and the send fails with `Overloaded`.
    pub async fn send_to(&self, origin: Origin, packet: &RawPacket) -> SessionResult<()> {
        let handle = self.get(origin).await.ok_or(SessionError::Closed)?;
        deliver(&handle, packet)
    }

    /// Send a packet to every session except `except`.
    /// Returns how many sessions accepted it.
    pub async fn broadcast(&self, packet: &RawPacket, except: Option<Origin>) -> usize {
        let targets: Vec<SessionHandle> = self
            .handles()
            .await
            .into_iter()
            .filter(|handle| Some(handle.origin()) != except)
            .collect();

        let mut delivered = 0;
        for handle in targets {
            match deliver(&handle, packet) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Broadcast to {} skipped: {}", handle.origin(), e),
            }
        }
        delivered
    }

    /// Kick every session that has been silent for at least `max_idle`.
    pub async fn kick_idle(&self, max_idle: Duration, reason: &str) -> Vec<Origin> {
        let idle: Vec<SessionHandle> = self
            .handles()
            .await
            .into_iter()
            .filter(|handle| handle.idle_time() >= max_idle)
            .collect();

        let mut kicked = Vec::with_capacity(idle.len());
        for handle in idle {
            tracing::info!("Kicking idle session {}", handle.origin());
            handle.kick(reason);
            kicked.push(handle.origin());
        }
        kicked
    }
}

fn deliver(handle: &SessionHandle, packet: &RawPacket) -> SessionResult<()> {
    let result = handle.try_send(packet);
    if let Err(SessionError::Overloaded) = result {
        tracing::warn!("Send queue of {} is full, disconnecting", handle.origin());
        handle.kick(SLOW_CONSUMER_REASON);
    }
    result
}
