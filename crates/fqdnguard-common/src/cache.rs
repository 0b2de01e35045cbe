//! FQDN reservation cache
//!
//! Maps `ingressClass/fqdn` to the HTTPProxy that currently owns it. Entries
//! come in two flavours:
//!
//! - **provisional** (`expires_at > 0`): written by the admission webhook
//!   before the object is persisted, valid until `expires_at`
//! - **confirmed** (`expires_at == 0`): written by the controller once the
//!   persisted object has been observed, never expires
//!
//! A single `RwLock` guards the map. The webhook takes the write guard once per
//! admission request through [`ReservationCache::write`] so its check-then-set
//! is atomic; the sweeper takes it once per cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;

/// namespace/name of the object owning a cache entry
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ResourceIdentity {
    /// Create an identity from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `ingressClass/fqdn` composite key. Case-sensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for an ingress class and FQDN
    pub fn new(ingress_class: &str, fqdn: &str) -> Self {
        Self(format!("{ingress_class}/{fqdn}"))
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner and expiry of a reserved key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// Object holding the key
    pub owner: ResourceIdentity,
    /// Unix seconds; 0 means confirmed
    pub expires_at: i64,
}

impl CacheEntry {
    /// Entry confirmed by reconciliation; never expires
    pub fn confirmed(owner: ResourceIdentity) -> Self {
        Self {
            owner,
            expires_at: 0,
        }
    }

    /// Admission-time reservation valid until `expires_at`
    pub fn provisional(owner: ResourceIdentity, expires_at: i64) -> Self {
        Self { owner, expires_at }
    }

    /// True for entries written by the controller
    pub fn is_confirmed(&self) -> bool {
        self.expires_at == 0
    }

    /// True for provisional entries whose deadline has passed
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at > 0 && self.expires_at <= now
    }
}

/// Source of "now" in unix seconds
pub trait Clock: Send + Sync {
    /// Current time in unix seconds
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    /// Create a clock pinned at `now`
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    /// Move the clock to `now`
    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward by `secs`
    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Process-wide reservation cache shared by the webhook and the controller
pub struct ReservationCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for ReservationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReservationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationCache")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl ReservationCache {
    /// Create an empty cache using the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty cache with a custom clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Current time according to the cache's clock
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Upsert an entry
    pub fn set(&self, key: CacheKey, entry: CacheEntry) {
        self.entries.write().insert(key, entry);
    }

    /// Look up an entry
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Whether the key is held by anyone
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// `None` if absent, otherwise whether the entry is confirmed
    pub fn is_confirmed(&self, key: &CacheKey) -> Option<bool> {
        self.entries.read().get(key).map(CacheEntry::is_confirmed)
    }

    /// Remove an entry; absent keys are ignored
    pub fn delete(&self, key: &CacheKey) {
        self.entries.write().remove(key);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is reserved
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sorted copy of every entry
    pub fn snapshot(&self) -> Vec<(CacheKey, CacheEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Take the exclusive lock for a multi-step check-then-set
    pub fn write(&self) -> CacheTxn<'_> {
        CacheTxn {
            entries: self.entries.write(),
            now: self.clock.now(),
        }
    }

    /// Evict lapsed provisional entries as of the cache's clock
    pub fn sweep(&self) -> usize {
        self.sweep_at(self.clock.now())
    }

    /// Evict provisional entries with `expires_at <= now`
    pub fn sweep_at(&self, now: i64) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();

        entries.retain(|key, entry| {
            if entry.is_expired_at(now) {
                info!(
                    key = %key,
                    owner = %entry.owner,
                    expired_at = entry.expires_at,
                    "Evicted expired provisional reservation"
                );
                false
            } else {
                true
            }
        });

        let evicted = before - entries.len();
        if evicted > 0 {
            metrics::CACHE_EVICTIONS.add(evicted as u64, &[]);
        }
        evicted
    }

    /// Start the background sweeper
    ///
    /// The returned handle must be shut down (and awaited) to guarantee the
    /// sweeper performs no further mutation.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let cache = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; nothing can be expired yet
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Cache sweeper stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = cache.sweep();
                        debug!(evicted, remaining = cache.len(), "Cache sweep completed");
                    }
                }
            }
        });

        SweeperHandle { cancel, task }
    }
}

/// Exclusive view of the cache held for the duration of one admission request
pub struct CacheTxn<'a> {
    entries: RwLockWriteGuard<'a, HashMap<CacheKey, CacheEntry>>,
    now: i64,
}

impl CacheTxn<'_> {
    /// Time captured when the lock was taken
    pub fn now(&self) -> i64 {
        self.now
    }

    /// Look up an entry
    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Whether the key is held by anyone
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// `None` if absent, otherwise whether the entry is confirmed
    pub fn is_confirmed(&self, key: &CacheKey) -> Option<bool> {
        self.entries.get(key).map(CacheEntry::is_confirmed)
    }

    /// Upsert an entry
    pub fn set(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Remove an entry; absent keys are ignored
    pub fn delete(&mut self, key: &CacheKey) {
        self.entries.remove(key);
    }
}

/// Handle to the running sweeper task
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for its task to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Cache sweeper task ended abnormally");
        }
    }
}
