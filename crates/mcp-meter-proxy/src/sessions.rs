//! Upstream session tokens, keyed by provider.
//!
//! The handshake for a provider captures the upstream's session token; every
//! later message to that provider carries it. The map is sharded
//! (`DashMap`), so handshakes for different providers never wait on each
//! other. Writes for the same provider are last-write-wins.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct SessionEntry {
    token: String,
    captured_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct SessionDirectory {
    entries: Arc<DashMap<String, SessionEntry>>,
    ttl: Option<Duration>,
}

impl SessionDirectory {
    /// `ttl` of None keeps entries until they are overwritten or removed.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn set(&self, provider_id: &str, token: &str) {
        self.entries.insert(
            provider_id.to_string(),
            SessionEntry {
                token: token.to_string(),
                captured_at: Instant::now(),
            },
        );
    }

    /// Current token for a provider. Expired entries read as absent.
    pub fn get(&self, provider_id: &str) -> Option<String> {
        let (token, expired) = match self.entries.get(provider_id) {
            Some(entry) => (entry.token.clone(), self.is_expired(&entry)),
            None => return None,
        };
        if expired {
            // Shard guard is released above; a fresh set() in between survives
            self.entries
                .remove_if(provider_id, |_, entry| self.is_expired(entry));
            return None;
        }
        Some(token)
    }

    pub fn remove(&self, provider_id: &str) {
        self.entries.remove(provider_id);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let keep = !self.is_expired(entry);
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &SessionEntry) -> bool {
        self.ttl
            .map(|ttl| entry.captured_at.elapsed() >= ttl)
            .unwrap_or(false)
    }
}

/// Spawn the background purge loop. Does nothing when sessions never expire.
pub fn start_expiry_task(sessions: SessionDirectory) -> Option<tokio::task::JoinHandle<()>> {
    sessions.ttl?;
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let purged = sessions.purge_expired();
            if purged > 0 {
                tracing::info!(purged, "Purged expired upstream sessions");
            }
        }
    }))
}
