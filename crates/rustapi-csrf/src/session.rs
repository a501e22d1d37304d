//! Session secret storage
//!
//! Tokens are signed with a secret that belongs to the client's session. The
//! layer identifies the session through a `HttpOnly` cookie and asks a
//! [`SecretStore`] for the matching secret, creating one on first need.

use crate::token::SessionSecret;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backend holding one [`SessionSecret`] per session id.
///
/// Implementations must be safe to call from concurrent requests.
pub trait SecretStore: Send + Sync + 'static {
    /// Look up the secret of a session.
    fn load(&self, session_id: &str) -> Option<SessionSecret>;

    /// Store (or replace) the secret of a session.
    fn store(&self, session_id: &str, secret: SessionSecret);

    /// Return the session secret, creating and storing a new one if absent.
    fn load_or_create(&self, session_id: &str) -> SessionSecret {
        if let Some(secret) = self.load(session_id) {
            return secret;
        }
        let secret = SessionSecret::generate();
        self.store(session_id, secret.clone());
        secret
    }

    /// Replace the session secret, invalidating every token signed with the
    /// previous one.
    fn rotate(&self, session_id: &str) -> SessionSecret {
        let secret = SessionSecret::generate();
        self.store(session_id, secret.clone());
        secret
    }
}

impl<T: SecretStore + ?Sized> SecretStore for Arc<T> {
    fn load(&self, session_id: &str) -> Option<SessionSecret> {
        (**self).load(session_id)
    }

    fn store(&self, session_id: &str, secret: SessionSecret) {
        (**self).store(session_id, secret)
    }

    fn load_or_create(&self, session_id: &str) -> SessionSecret {
        (**self).load_or_create(session_id)
    }
}

/// Writes between two expiry sweeps of [`MemorySecretStore`].
const PRUNE_INTERVAL: usize = 1024;

#[derive(Debug)]
struct Entry {
    secret: SessionSecret,
    touched: Instant,
}

impl Entry {
    fn new(secret: SessionSecret, now: Instant) -> Self {
        Self {
            secret,
            touched: now,
        }
    }
}

/// In-process secret store.
///
/// Suitable for a single instance; multi-instance deployments should plug in
/// a shared backend. With a TTL, sessions idle for longer than the TTL are
/// forgotten and swept out periodically.
#[derive(Debug, Default, Clone)]
pub struct MemorySecretStore {
    secrets: Arc<DashMap<String, Entry>>,
    ttl: Option<Duration>,
    writes: Arc<AtomicUsize>,
}

impl MemorySecretStore {
    /// Create an empty store whose sessions never expire.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store forgetting sessions idle for longer than `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Idle time after which a session is forgotten.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Number of stored sessions, including expired ones not yet pruned.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Whether no session has a secret yet.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Drop the secret of a session, e.g. on logout.
    pub fn remove(&self, session_id: &str) {
        self.secrets.remove(session_id);
    }

    /// Drop every expired session.
    pub fn prune(&self) {
        if self.ttl.is_none() {
            return;
        }
        let now = Instant::now();
        let before = self.secrets.len();
        self.secrets.retain(|_, entry| !self.is_expired(entry, now));
        tracing::debug!(
            pruned = before.saturating_sub(self.secrets.len()),
            "CSRF session secrets pruned"
        );
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(entry.touched) > ttl)
    }

    fn note_write(&self) {
        let n = self.writes.fetch_add(1, Ordering::Relaxed);
        if self.ttl.is_some() && n % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
            self.prune();
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn load(&self, session_id: &str) -> Option<SessionSecret> {
        let now = Instant::now();
        if let Some(mut entry) = self.secrets.get_mut(session_id) {
            if !self.is_expired(&entry, now) {
                entry.touched = now;
                return Some(entry.secret.clone());
            }
        }
        self.secrets
            .remove_if(session_id, |_, entry| self.is_expired(entry, now));
        None
    }

    fn store(&self, session_id: &str, secret: SessionSecret) {
        self.secrets
            .insert(session_id.to_string(), Entry::new(secret, Instant::now()));
        self.note_write();
    }

    fn load_or_create(&self, session_id: &str) -> SessionSecret {
        let now = Instant::now();
        let secret = {
            let mut entry = self
                .secrets
                .entry(session_id.to_string())
                .or_insert_with(|| Entry::new(SessionSecret::generate(), now));
            if self.is_expired(&entry, now) {
                entry.secret = SessionSecret::generate();
            }
            entry.touched = now;
            entry.secret.clone()
        };
        self.note_write();
        secret
    }
}
