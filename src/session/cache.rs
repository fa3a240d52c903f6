use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::crypto::SessionKeys;
use crate::envelope::Envelope;

/// Opaque session identifier handed out in the `sessionlh` cookie.
pub type SessionId = String;

/// Responder-side record of a negotiated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub envelope: Envelope,
    pub keys: SessionKeys,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
    timer: AbortHandle,
}

/// Sliding-TTL map. Every entry owns an expiry task; replacing or touching
/// an entry re-arms it. The lock is never held across an `.await`.
pub struct SessionCache<V> {
    inner: Arc<Mutex<HashMap<SessionId, Entry<V>>>>,
    ttl: Duration,
}

impl<V> Clone for SessionCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            ttl: self.ttl,
        }
    }
}

impl<V: Clone + Send + 'static> SessionCache<V> {
    /// Must be called from within a Tokio runtime.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Entry<V>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, id: &str, deadline: Instant) -> AbortHandle {
        let map = Arc::downgrade(&self.inner);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(map) = map.upgrade() else { return };
            let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
            if map.get(&id).is_some_and(|e| e.expires_at <= deadline) {
                map.remove(&id);
                tracing::debug!(session = %id, "session expired");
            }
        })
        .abort_handle()
    }

    /// Insert or replace `id`, cancelling any previous timer.
    ///
    /// The timer is armed while the lock is held, so it always finds the
    /// entry it was armed for.
    pub fn set(&self, id: impl Into<SessionId>, value: V) {
        let id = id.into();
        let expires_at = Instant::now() + self.ttl;
        let mut map = self.lock();
        let timer = self.arm(&id, expires_at);
        let previous = map.insert(
            id,
            Entry {
                value,
                expires_at,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }
    }

    /// The live value for `id`, or `None` if unknown or expired.
    pub fn get(&self, id: &str) -> Option<V> {
        let map = self.lock();
        map.get(id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    /// Like [`get`](Self::get), but also pushes the deadline out by one TTL.
    pub fn touch(&self, id: &str) -> Option<V> {
        let expires_at = Instant::now() + self.ttl;
        let mut map = self.lock();
        let entry = map.get_mut(id).filter(|e| e.expires_at > Instant::now())?;
        entry.timer.abort();
        entry.expires_at = expires_at;
        entry.timer = self.arm(id, expires_at);
        Some(entry.value.clone())
    }

    /// Drop `id` immediately. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        match self.lock().remove(id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Number of entries not yet reaped, including ones past their deadline.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for (_, entry) in self.lock().drain() {
            entry.timer.abort();
        }
    }
}
