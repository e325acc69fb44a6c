use super::{SessionStore, Storage};
use crate::context::ContextConfig;
use crate::core::{ContextError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

struct StoredSession {
    payload: Vec<u8>,
    // Fresh sessions carry no expiry until first persisted.
    expires_at: Option<Instant>,
}

impl StoredSession {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`SessionStore`] keeping MessagePack payloads under
/// `"{prefix}:{token}"` keys with a sliding expiry.
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, StoredSession>>,
    key_prefix: String,
    ttl: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

impl MemorySessionStore {
    pub fn new(key_prefix: &str, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            key_prefix: key_prefix.to_string(),
            ttl,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(&config.key_prefix, config.session_ttl)
    }

    fn key(&self, token: &str) -> String {
        format!("{}:{}", self.key_prefix, token)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry for a session touched at `now`; `None` when the TTL runs past
    /// what the clock can represent.
    fn expiry(&self, now: Instant) -> Option<Instant> {
        now.checked_add(self.ttl)
    }

    /// Whether a live (unexpired) session exists for `token`.
    pub async fn contains(&self, token: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(&self.key(token))
            .is_some_and(|s| !s.is_expired(Instant::now()))
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|s| !s.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn connect(&self, token: &str) -> Result<Storage> {
        let key = self.key(token);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let live = entries.get(&key).is_some_and(|s| !s.is_expired(now));
        if !live {
            entries.remove(&key);
            trace!(token, "session miss");
            return Err(ContextError::SessionNotFound(token.to_string()));
        }

        let Some(stored) = entries.get_mut(&key) else {
            return Err(ContextError::SessionNotFound(token.to_string()));
        };
        stored.expires_at = self.expiry(now);
        Storage::decode(&stored.payload).map_err(|err| {
            warn!(token, error = %err, "session payload could not be decoded");
            ContextError::SessionNotFound("Session corrupted".into())
        })
    }

    async fn disconnect(&self, session: &Storage, token: &str) -> Result<()> {
        let payload = session.encode()?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            self.key(token),
            StoredSession {
                payload,
                expires_at: self.expiry(Instant::now()),
            },
        );
        Ok(())
    }

    async fn create(&self) -> Result<(String, Storage)> {
        let session = Storage::new();
        let payload = session.encode()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let mut token = Uuid::new_v4().to_string();
        while entries.get(&self.key(&token)).is_some_and(|s| !s.is_expired(now)) {
            token = Uuid::new_v4().to_string();
        }
        entries.insert(
            self.key(&token),
            StoredSession {
                payload,
                expires_at: None,
            },
        );
        debug!(token = %token, "session created");
        Ok((token, session))
    }

    async fn destroy(&self, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(&self.key(token)).is_some())
    }
}
