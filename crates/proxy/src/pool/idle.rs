//! Idle session cache
//!
//! Pre-warmed backing transports waiting for a client. At most one entry per
//! key; each entry remembers the fingerprint of the parameters it was built
//! from so a stale transport is never handed out.
//!
//! Every key carries a generation counter. Invalidation bumps it, and a warm
//! that started under an older generation discards its transport instead of
//! caching it.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::mcp::TransportResult;
use crate::transport::Transport;

struct IdleEntry {
    fingerprint: String,
    transport: Arc<dyn Transport>,
}

struct IdleState<K> {
    entries: HashMap<K, IdleEntry>,
    generations: HashMap<K, u64>,
}

/// Keyed cache of pre-warmed transports
pub struct IdleSessionCache<K> {
    state: Mutex<IdleState<K>>,
}

impl<K> IdleSessionCache<K>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IdleState {
                entries: HashMap::new(),
                generations: HashMap::new(),
            }),
        }
    }

    /// Take the cached transport for `key` if it was built from `fingerprint`.
    ///
    /// A stale or dead entry is purged and closed.
    pub async fn take(&self, key: &K, fingerprint: &str) -> Option<Arc<dyn Transport>> {
        let entry = self.state.lock().ok()?.entries.remove(key)?;

        if entry.fingerprint == fingerprint && !entry.transport.is_closed() {
            tracing::debug!(key = %key, "Reusing idle session");
            return Some(entry.transport);
        }

        tracing::debug!(key = %key, "Purging stale idle session");
        entry.transport.close().await;
        None
    }

    pub fn generation(&self, key: &K) -> u64 {
        self.state
            .lock()
            .map(|state| state.generations.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Build a transport with `build` and cache it, unless the key was
    /// invalidated or filled while building. Failures leave the cache empty.
    pub async fn warm<F>(&self, key: K, fingerprint: String, build: F) -> bool
    where
        F: Future<Output = TransportResult<Arc<dyn Transport>>>,
    {
        let generation = self.generation(&key);

        let transport = match build.await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to pre-warm idle session");
                return false;
            }
        };

        match self.insert_if_current(key.clone(), generation, fingerprint, transport.clone()) {
            Ok(replaced) => {
                if let Some(stale) = replaced {
                    stale.close().await;
                }
                tracing::debug!(key = %key, "Idle session warmed");
                true
            }
            Err(()) => {
                tracing::debug!(key = %key, "Discarding idle session warmed under an old generation");
                transport.close().await;
                false
            }
        }
    }

    /// Err when the generation moved or a matching entry is already cached.
    /// Ok carries a stale entry that was displaced.
    fn insert_if_current(
        &self,
        key: K,
        generation: u64,
        fingerprint: String,
        transport: Arc<dyn Transport>,
    ) -> Result<Option<Arc<dyn Transport>>, ()> {
        let mut state = self.state.lock().map_err(|_| ())?;
        if state.generations.get(&key).copied().unwrap_or(0) != generation {
            return Err(());
        }
        if let Some(existing) = state.entries.get(&key) {
            if existing.fingerprint == fingerprint && !existing.transport.is_closed() {
                return Err(());
            }
        }
        let replaced = state
            .entries
            .insert(
                key,
                IdleEntry {
                    fingerprint,
                    transport,
                },
            )
            .map(|entry| entry.transport);
        Ok(replaced)
    }

    /// Drop and close the entry for `key`; in-flight warms for it are voided
    pub async fn invalidate(&self, key: &K) -> bool {
        let removed = match self.state.lock() {
            Ok(mut state) => {
                *state.generations.entry(key.clone()).or_insert(0) += 1;
                state.entries.remove(key)
            }
            Err(_) => None,
        };

        match removed {
            Some(entry) => {
                tracing::info!(key = %key, "Idle session invalidated");
                entry.transport.close().await;
                true
            }
            None => false,
        }
    }

    /// Keys whose cached entry satisfies `predicate`
    pub fn keys_where(&self, predicate: impl Fn(&K, &str) -> bool) -> Vec<K> {
        self.state
            .lock()
            .map(|state| {
                state
                    .entries
                    .iter()
                    .filter(|(key, entry)| predicate(key, &entry.fingerprint))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Close everything and void every in-flight warm
    pub async fn clear(&self) {
        let drained: Vec<IdleEntry> = match self.state.lock() {
            Ok(mut state) => {
                let IdleState {
                    entries,
                    generations,
                } = &mut *state;
                for key in entries.keys() {
                    generations.entry(key.clone()).or_insert(0);
                }
                for generation in generations.values_mut() {
                    *generation += 1;
                }
                entries.drain().map(|(_, entry)| entry).collect()
            }
            Err(_) => Vec::new(),
        };

        for entry in drained {
            entry.transport.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for IdleSessionCache<K>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}
