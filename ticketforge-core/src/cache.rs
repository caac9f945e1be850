//! Time-bounded token cache.
//!
//! This module provides:
//! - [`TokenCache`] - A TTL-keyed store with a background expiry sweep
//! - [`Namespace`] - Key prefixes that let one store serve several purposes
//!
//! Expiry is enforced when an entry is read, so an entry stops being visible
//! the moment its TTL elapses regardless of when the sweep last ran. The sweep
//! only bounds memory.
//!
//! # Example
//!
//! ```rust
//! use ticketforge_core::{Namespace, TokenCache};
//!
//! let cache = TokenCache::new();
//! cache.set_in(Namespace::Token, "HTTP/svc.example.com", "YIIC...");
//! assert_eq!(
//!     cache.get("token:HTTP/svc.example.com").unwrap().expose(),
//!     "YIIC..."
//! );
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

use crate::store::Secret;

/// Default interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline used when `now + ttl` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + after`, clamped to a far-future deadline instead of overflowing.
fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Logical purpose of a cache entry, encoded as a key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Service tickets, keyed by identity.
    Token,
    /// Bearer JWTs.
    Jwt,
    /// Other short-lived secrets.
    Secret,
}

impl Namespace {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Token => "token:",
            Self::Jwt => "jwt:",
            Self::Secret => "secret:",
        }
    }

    /// Lifetime used by [`TokenCache::set_in`].
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::Token => Duration::from_secs(10 * 60),
            Self::Jwt => Duration::from_secs(5 * 60),
            Self::Secret => Duration::from_secs(30 * 60),
        }
    }

    /// The full cache key for `name`.
    pub fn key(self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }
}

#[derive(Clone)]
struct Entry {
    value: Secret,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct Inner {
    entries: RwLock<HashMap<String, Entry>>,
    stop: Arc<Notify>,
    sweeping: AtomicBool,
}

impl Inner {
    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}

/// A concurrent, TTL-keyed store of secret values.
///
/// Clones share the same entries. The background sweeper, when running,
/// stops once the last clone is dropped or [`shutdown`](Self::shutdown) is
/// called.
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Inner>,
}

impl TokenCache {
    /// Create a cache sweeping every [`DEFAULT_SWEEP_INTERVAL`].
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a cache with a custom sweep interval.
    ///
    /// The sweeper is spawned on the current tokio runtime. Outside a
    /// runtime no sweeper runs; expired entries are still invisible to
    /// readers and can be dropped with [`purge_expired`](Self::purge_expired).
    pub fn with_sweep_interval(interval: Duration) -> Self {
        let cache = Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                stop: Arc::new(Notify::new()),
                sweeping: AtomicBool::new(false),
            }),
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            if !interval.is_zero() {
                cache.inner.sweeping.store(true, Ordering::SeqCst);
                handle.spawn(sweep(
                    Arc::downgrade(&cache.inner),
                    cache.inner.stop.clone(),
                    interval,
                ));
            }
        }
        cache
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Secret>, ttl: Duration) {
        let entry = Entry {
            value: value.into(),
            expires_at: deadline(Instant::now(), ttl),
        };
        self.inner.entries.write().insert(key.into(), entry);
    }

    /// The value under `key`, unless it is missing or expired.
    pub fn get(&self, key: &str) -> Option<Secret> {
        self.get_with_expiry(key).map(|(value, _)| value)
    }

    /// The value under `key` and its remaining lifetime.
    pub fn get_with_expiry(&self, key: &str) -> Option<(Secret, Duration)> {
        let now = Instant::now();
        let entries = self.inner.entries.read();
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        Some((entry.value.clone(), entry.expires_at - now))
    }

    /// Remove `key`. Returns whether a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .entries
            .write()
            .remove(key)
            .is_some_and(|e| e.is_live(now))
    }

    /// Snapshot of the keys currently tracked, sorted.
    ///
    /// Entries that have expired but not yet been swept are included.
    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .read()
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.entries.write().clear();
    }

    /// Drop expired entries now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Store under `namespace` with the namespace's default lifetime.
    pub fn set_in(&self, namespace: Namespace, name: &str, value: impl Into<Secret>) {
        self.set(namespace.key(name), value, namespace.default_ttl());
    }

    pub fn get_in(&self, namespace: Namespace, name: &str) -> Option<Secret> {
        self.get(&namespace.key(name))
    }

    pub fn delete_in(&self, namespace: Namespace, name: &str) -> bool {
        self.delete(&namespace.key(name))
    }

    /// Whether a background sweeper was started for this cache.
    pub fn is_sweeping(&self) -> bool {
        self.inner.sweeping.load(Ordering::SeqCst)
    }

    /// Stop the background sweeper. Entries are kept.
    pub fn shutdown(&self) {
        if self.inner.sweeping.swap(false, Ordering::SeqCst) {
            self.inner.stop.notify_one();
        }
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("keys_count", &self.inner.entries.read().len())
            .field("sweeping", &self.is_sweeping())
            .finish()
    }
}

async fn sweep(inner: Weak<Inner>, stop: Arc<Notify>, period: Duration) {
    let mut ticker = tokio::time::interval_at(deadline(Instant::now(), period), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.notified() => break,
        }

        let Some(inner) = inner.upgrade() else { break };
        let removed = inner.purge_expired();
        if removed > 0 {
            tracing::debug!(removed, "expired cache entries swept");
        }
    }
    tracing::trace!("cache sweeper stopped");
}
