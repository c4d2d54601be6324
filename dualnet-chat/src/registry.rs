use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};

use crate::rate_limit::RateLimiter;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a client with identity {0} is already registered")]
    DuplicateIdentity(String),
}

/// State for one connected peer.
///
/// Entries are shared as `Arc`s so a snapshot stays valid even if the entry is
/// removed from the registry while a broadcast is still walking it.
pub struct ClientEntry<K, S> {
    identity: K,
    display_name: String,
    limiter: parking_lot::Mutex<RateLimiter>,
    last_activity: parking_lot::Mutex<Instant>,
    sink: S,
}

impl<K, S> ClientEntry<K, S> {
    pub fn new(identity: K, display_name: String, limiter: RateLimiter, sink: S) -> Self {
        Self {
            identity,
            display_name,
            limiter: parking_lot::Mutex::new(limiter),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            sink,
        }
    }

    pub fn identity(&self) -> &K {
        &self.identity
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn try_admit(&self) -> bool {
        self.limiter.lock().try_admit()
    }

    /// Records that the peer was heard from at `now`.
    pub fn touch_at(&self, now: Instant) {
        *self.last_activity.lock() = now;
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_activity()) > threshold
    }
}

impl<K: Debug, S> Debug for ClientEntry<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEntry")
            .field("identity", &self.identity)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Concurrency-safe table of connected clients keyed by transport identity.
///
/// Callers only get atomic operations; the underlying map never escapes.
pub struct ClientRegistry<K, S> {
    clients: Mutex<HashMap<K, Arc<ClientEntry<K, S>>>>,
}

impl<K, S> ClientRegistry<K, S>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(
        &self,
        entry: ClientEntry<K, S>,
    ) -> Result<Arc<ClientEntry<K, S>>, RegistryError> {
        let mut clients = self.clients.lock().await;
        if clients.contains_key(&entry.identity) {
            return Err(RegistryError::DuplicateIdentity(format!(
                "{:?}",
                entry.identity
            )));
        }

        let entry = Arc::new(entry);
        clients.insert(entry.identity.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Removes the entry if present; removing an unknown identity is a no-op.
    pub async fn remove(&self, identity: &K) -> Option<Arc<ClientEntry<K, S>>> {
        let mut clients = self.clients.lock().await;
        clients.remove(identity)
    }

    pub async fn get(&self, identity: &K) -> Option<Arc<ClientEntry<K, S>>> {
        let clients = self.clients.lock().await;
        clients.get(identity).cloned()
    }

    /// Looks up a client and records activity at `now` in one critical
    /// section, so the reaper can never expire it between the two steps.
    pub async fn touch(&self, identity: &K, now: Instant) -> Option<Arc<ClientEntry<K, S>>> {
        let clients = self.clients.lock().await;
        let entry = clients.get(identity)?;
        entry.touch_at(now);
        Some(Arc::clone(entry))
    }

    /// Empties the registry and hands back everything that was in it.
    pub async fn take_all(&self) -> Vec<Arc<ClientEntry<K, S>>> {
        let mut clients = self.clients.lock().await;
        clients.drain().map(|(_, entry)| entry).collect()
    }

    /// Point-in-time copy of every entry, safe to iterate without the lock.
    pub async fn snapshot(&self) -> Vec<Arc<ClientEntry<K, S>>> {
        let clients = self.clients.lock().await;
        clients.values().cloned().collect()
    }

    /// Removes and returns every entry idle for longer than `threshold`.
    pub async fn remove_idle(
        &self,
        now: Instant,
        threshold: Duration,
    ) -> Vec<Arc<ClientEntry<K, S>>> {
        let mut clients = self.clients.lock().await;
        let idle: Vec<K> = clients
            .iter()
            .filter(|(_, entry)| entry.is_idle(now, threshold))
            .map(|(identity, _)| identity.clone())
            .collect();

        idle.iter()
            .filter_map(|identity| clients.remove(identity))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

impl<K, S> Default for ClientRegistry<K, S>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
