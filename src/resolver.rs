//! Hostname resolution cache for upstream connections.
//!
//! Lookups are served from memory while a record is fresh. Once a record
//! expires it keeps being served while a single background task
//! re-resolves the hostname, so a slow or failing resolver never stalls
//! requests that already have a working address list. Only a hostname
//! that has never resolved makes the caller wait, and then only for the
//! bounded resolve timeout.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Retry delay for a hostname whose re-resolution failed while a stale
/// record was still available.
const STALE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Source of address lists for the cache.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    /// Resolves `host` to its addresses in preference order.
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in tokio::net::lookup_host((host, 0)).await? {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

/// A resolved address list and its expiry.
///
/// Records are never modified after creation; a refresh swaps in a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct HostRecord {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
    pub expires_at: Instant,
}

impl HostRecord {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Per-hostname state.
struct HostEntry {
    record: RwLock<Option<Arc<HostRecord>>>,
    /// Set while a background refresh task owns this entry.
    refreshing: AtomicBool,
    /// Serializes resolutions of this hostname.
    resolve_lock: Mutex<()>,
    /// Completed cold resolutions. Callers that queued behind one share its
    /// outcome instead of resolving again.
    attempts: AtomicU64,
    /// Error of the last failed cold resolution.
    failure: parking_lot::Mutex<Option<ProxyError>>,
    /// Looked up since the last refresh pass.
    used: AtomicBool,
}

impl HostEntry {
    fn new() -> Self {
        Self {
            record: RwLock::new(None),
            refreshing: AtomicBool::new(false),
            resolve_lock: Mutex::new(()),
            attempts: AtomicU64::new(0),
            failure: parking_lot::Mutex::new(None),
            used: AtomicBool::new(true),
        }
    }

    fn current(&self) -> Option<Arc<HostRecord>> {
        self.record.read().clone()
    }

    fn store(&self, record: HostRecord) {
        *self.record.write() = Some(Arc::new(record));
    }

    /// The failure of the attempt a waiter queued behind.
    fn shared_failure(&self, host: &str) -> ProxyError {
        match &*self.failure.lock() {
            Some(err) => duplicate_error(err, host),
            None => ProxyError::Resolution {
                host: host.to_string(),
                source: io::Error::other("concurrent resolution failed"),
            },
        }
    }
}

/// Copies a resolution error so every waiter of one attempt can own it.
fn duplicate_error(err: &ProxyError, host: &str) -> ProxyError {
    match err {
        ProxyError::Resolution { host, source } => ProxyError::Resolution {
            host: host.clone(),
            source: io::Error::new(source.kind(), source.to_string()),
        },
        ProxyError::ResolutionTimeout { host, timeout } => ProxyError::ResolutionTimeout {
            host: host.clone(),
            timeout: *timeout,
        },
        ProxyError::NoAddresses { host } => ProxyError::NoAddresses { host: host.clone() },
        other => ProxyError::Resolution {
            host: host.to_string(),
            source: io::Error::other(other.to_string()),
        },
    }
}

/// Cache timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// How long a resolved record stays fresh.
    pub ttl: Duration,
    /// Upper bound for a single resolution.
    pub resolve_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(5),
        }
    }
}

struct Inner {
    resolver: Arc<dyn Resolve>,
    entries: RwLock<HashMap<String, Arc<HostEntry>>>,
    settings: CacheSettings,
}

/// Shared, cheaply cloneable DNS cache.
#[derive(Clone)]
pub struct DnsCache {
    inner: Arc<Inner>,
}

impl DnsCache {
    /// Creates a cache in front of `resolver`.
    pub fn new(resolver: Arc<dyn Resolve>, settings: CacheSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                entries: RwLock::new(HashMap::new()),
                settings,
            }),
        }
    }

    /// Creates a cache backed by the system resolver.
    pub fn system(settings: CacheSettings) -> Self {
        Self::new(Arc::new(SystemResolver), settings)
    }

    pub fn settings(&self) -> CacheSettings {
        self.inner.settings
    }

    /// Returns the addresses for `hostname`, never an empty list.
    ///
    /// IP literals are returned as-is without touching the cache.
    pub async fn lookup(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let key = hostname.to_ascii_lowercase();

        loop {
            let entry = self.entry(&key);
            entry.used.store(true, Ordering::Relaxed);

            if let Some(record) = entry.current() {
                if record.is_fresh(Instant::now()) {
                    trace!(host = %key, "DNS cache hit");
                } else {
                    debug!(host = %key, "Serving stale DNS record while refreshing");
                    self.spawn_refresh(&key, &entry);
                }
                return Ok(record.addresses.clone());
            }

            let attempt = entry.attempts.load(Ordering::Acquire);
            let _guard = entry.resolve_lock.lock().await;

            // Another caller may have resolved it while we waited.
            if let Some(record) = entry.current() {
                trace!(host = %key, "DNS cache filled by concurrent lookup");
                return Ok(record.addresses.clone());
            }
            if entry.attempts.load(Ordering::Acquire) != attempt {
                trace!(host = %key, "Sharing failure of concurrent lookup");
                return Err(entry.shared_failure(&key));
            }
            if !self.is_tracked(&key, &entry) {
                // Retired by a failed attempt that finished before we queued.
                continue;
            }

            return match self.inner.resolve_record(&key).await {
                Ok(record) => {
                    let addresses = record.addresses.clone();
                    entry.store(record);
                    entry.attempts.fetch_add(1, Ordering::AcqRel);
                    Ok(addresses)
                }
                Err(e) => {
                    *entry.failure.lock() = Some(duplicate_error(&e, &key));
                    self.retire(&key, &entry);
                    entry.attempts.fetch_add(1, Ordering::AcqRel);
                    Err(e)
                }
            };
        }
    }

    /// The current record for `hostname`, fresh or stale.
    pub fn peek(&self, hostname: &str) -> Option<Arc<HostRecord>> {
        self.inner
            .entries
            .read()
            .get(&hostname.to_ascii_lowercase())
            .and_then(|entry| entry.current())
    }

    /// Number of hostnames tracked.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-resolves every known hostname.
    ///
    /// With `clear_unused`, hostnames not looked up since the previous pass
    /// are dropped instead of refreshed. Hostnames with a refresh already in
    /// flight are skipped.
    pub async fn refresh(&self, clear_unused: bool) {
        let entries: Vec<(String, Arc<HostEntry>)> = self
            .inner
            .entries
            .read()
            .iter()
            .map(|(host, entry)| (host.clone(), entry.clone()))
            .collect();

        for (host, entry) in entries {
            if clear_unused && !entry.used.swap(false, Ordering::AcqRel) {
                let mut map = self.inner.entries.write();
                if map.get(&host).is_some_and(|cur| Arc::ptr_eq(cur, &entry)) {
                    map.remove(&host);
                    debug!(host = %host, "Evicted unused DNS entry");
                }
                continue;
            }

            if entry.refreshing.swap(true, Ordering::AcqRel) {
                continue;
            }
            self.inner.refresh_entry(&host, &entry).await;
            entry.refreshing.store(false, Ordering::Release);
        }
    }

    /// Spawns a task that calls [`DnsCache::refresh`] every `interval`,
    /// evicting hostnames that were not used in between.
    pub fn spawn_refresher(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.refresh(true).await;
            }
        })
    }

    fn entry(&self, key: &str) -> Arc<HostEntry> {
        if let Some(entry) = self.inner.entries.read().get(key) {
            return entry.clone();
        }
        self.inner
            .entries
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(HostEntry::new()))
            .clone()
    }

    fn is_tracked(&self, key: &str, entry: &Arc<HostEntry>) -> bool {
        self.inner
            .entries
            .read()
            .get(key)
            .is_some_and(|cur| Arc::ptr_eq(cur, entry))
    }

    /// Drops an entry that never resolved, so failed hostnames do not
    /// accumulate in the map.
    fn retire(&self, key: &str, entry: &Arc<HostEntry>) {
        let mut map = self.inner.entries.write();
        if map.get(key).is_some_and(|cur| Arc::ptr_eq(cur, entry)) && entry.current().is_none() {
            map.remove(key);
        }
    }

    /// Starts a background refresh unless one is already running. The task
    /// is detached from the calling request.
    fn spawn_refresh(&self, key: &str, entry: &Arc<HostEntry>) {
        if entry.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = self.inner.clone();
        let entry = entry.clone();
        let host = key.to_string();
        tokio::spawn(async move {
            inner.refresh_entry(&host, &entry).await;
            entry.refreshing.store(false, Ordering::Release);
        });
    }
}

impl Inner {
    async fn resolve_record(&self, host: &str) -> Result<HostRecord> {
        let started = Instant::now();
        let timeout = self.settings.resolve_timeout;

        let addresses = match tokio::time::timeout(timeout, self.resolver.resolve(host)).await {
            Ok(Ok(addresses)) => addresses,
            Ok(Err(source)) => {
                return Err(ProxyError::Resolution {
                    host: host.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ProxyError::ResolutionTimeout {
                    host: host.to_string(),
                    timeout,
                })
            }
        };

        if addresses.is_empty() {
            return Err(ProxyError::NoAddresses {
                host: host.to_string(),
            });
        }

        debug!(
            host = %host,
            addresses = ?addresses,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Resolved hostname"
        );

        Ok(HostRecord {
            hostname: host.to_string(),
            addresses,
            expires_at: Instant::now() + self.settings.ttl,
        })
    }

    async fn refresh_entry(&self, host: &str, entry: &HostEntry) {
        let _guard = entry.resolve_lock.lock().await;
        // No record yet means the first resolution is still running on the
        // cold path.
        let Some(stale) = entry.current() else {
            return;
        };

        match self.resolve_record(host).await {
            Ok(record) => entry.store(record),
            Err(e) => {
                warn!(
                    host = %host,
                    error = %e,
                    addresses = ?stale.addresses,
                    "DNS refresh failed, keeping stale record"
                );
                entry.store(HostRecord {
                    hostname: stale.hostname.clone(),
                    addresses: stale.addresses.clone(),
                    expires_at: Instant::now() + self.settings.ttl.min(STALE_RETRY_INTERVAL),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Resolver returning a configurable answer and counting calls.
    struct CountingResolver {
        calls: AtomicUsize,
        answer: parking_lot::Mutex<io::Result<Vec<IpAddr>>>,
        delay: Duration,
    }

    impl CountingResolver {
        fn new(addrs: &[&str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answer: parking_lot::Mutex::new(Ok(ips(addrs))),
                delay,
            })
        }

        fn failing(delay: Duration) -> Arc<Self> {
            let resolver = Self::new(&[], delay);
            resolver.fail();
            resolver
        }

        fn set(&self, addrs: &[&str]) {
            *self.answer.lock() = Ok(ips(addrs));
        }

        fn fail(&self) {
            *self.answer.lock() = Err(io::Error::new(io::ErrorKind::Other, "resolver down"));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolve for CountingResolver {
        async fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &*self.answer.lock() {
                Ok(addrs) => Ok(addrs.clone()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    fn ips(addrs: &[&str]) -> Vec<IpAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn cache(resolver: Arc<CountingResolver>, ttl: Duration) -> DnsCache {
        DnsCache::new(
            resolver,
            CacheSettings {
                ttl,
                resolve_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn test_lookup_cached_within_ttl() {
        let resolver = CountingResolver::new(&["10.0.0.2", "10.0.0.1"], Duration::ZERO);
        let cache = cache(resolver.clone(), Duration::from_secs(60));

        let first = cache.lookup("upstream.local").await.unwrap();
        for _ in 0..5 {
            assert_eq!(cache.lookup("upstream.local").await.unwrap(), first);
        }

        assert_eq!(first, ips(&["10.0.0.2", "10.0.0.1"]));
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_case_insensitive_lookup() {
        let resolver = CountingResolver::new(&["10.0.0.1"], Duration::ZERO);
        let cache = cache(resolver.clone(), Duration::from_secs(60));

        cache.lookup("Upstream.LOCAL").await.unwrap();
        cache.lookup("upstream.local").await.unwrap();

        assert_eq!(resolver.calls(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.peek("UPSTREAM.local").is_some());
    }

    #[tokio::test]
    async fn test_ip_literal_bypasses_cache() {
        let resolver = CountingResolver::new(&["10.0.0.1"], Duration::ZERO);
        let cache = cache(resolver.clone(), Duration::from_secs(60));

        assert_eq!(cache.lookup("192.168.1.1").await.unwrap(), ips(&["192.168.1.1"]));
        assert_eq!(cache.lookup("::1").await.unwrap(), ips(&["::1"]));
        assert_eq!(resolver.calls(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cold_failure_propagates() {
        let resolver = CountingResolver::failing(Duration::ZERO);
        let cache = cache(resolver.clone(), Duration::from_secs(60));

        let err = cache.lookup("upstream.local").await.unwrap_err();
        assert!(matches!(err, ProxyError::Resolution { ref host, .. } if host == "upstream.local"));

        // Failures are not cached; the next lookup resolves again.
        resolver.set(&["10.0.0.1"]);
        assert_eq!(cache.lookup("upstream.local").await.unwrap(), ips(&["10.0.0.1"]));
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_answer_is_an_error() {
        let resolver = CountingResolver::new(&[], Duration::ZERO);
        let cache = cache(resolver, Duration::from_secs(60));

        let err = cache.lookup("upstream.local").await.unwrap_err();
        assert!(matches!(err, ProxyError::NoAddresses { .. }));
        assert!(cache.peek("upstream.local").is_none());
    }

    #[tokio::test]
    async fn test_resolution_timeout() {
        let resolver = CountingResolver::new(&["10.0.0.1"], Duration::from_millis(500));
        let cache = DnsCache::new(
            resolver,
            CacheSettings {
                ttl: Duration::from_secs(60),
                resolve_timeout: Duration::from_millis(50),
            },
        );

        let err = cache.lookup("slow.local").await.unwrap_err();
        assert!(matches!(err, ProxyError::ResolutionTimeout { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_cold_lookups_resolve_once() {
        let resolver = CountingResolver::new(&["10.0.0.1"], Duration::from_millis(50));
        let cache = cache(resolver.clone(), Duration::from_secs(60));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.lookup("upstream.local").await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), ips(&["10.0.0.1"]));
        }
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_failures_share_one_attempt() {
        let resolver = CountingResolver::failing(Duration::from_millis(200));
        let cache = cache(resolver.clone(), Duration::from_secs(60));
        let started = std::time::Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let result = cache.lookup("down.local").await;
                    (result, started.elapsed())
                })
            })
            .collect();

        for handle in handles {
            let (result, elapsed) = handle.await.unwrap();
            let err = result.unwrap_err();
            assert!(matches!(err, ProxyError::Resolution { ref host, .. } if host == "down.local"));
            assert!(err.to_string().contains("resolver down"));
            // One resolver round trip, not one per waiting caller.
            assert!(elapsed < Duration::from_millis(600), "waited {elapsed:?}");
        }
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_cold_lookup_leaves_no_entry() {
        let resolver = CountingResolver::failing(Duration::ZERO);
        let cache = cache(resolver.clone(), Duration::from_secs(60));

        for _ in 0..3 {
            assert!(cache.lookup("down.local").await.is_err());
            assert!(cache.is_empty());
        }
        assert_eq!(resolver.calls(), 3);

        resolver.set(&["10.0.0.1"]);
        assert_eq!(cache.lookup("down.local").await.unwrap(), ips(&["10.0.0.1"]));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_outlives_cancelled_caller() {
        let resolver = CountingResolver::new(&["10.0.0.1"], Duration::from_millis(100));
        let cache = cache(resolver.clone(), Duration::from_millis(200));

        cache.lookup("upstream.local").await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        resolver.set(&["10.0.0.9"]);

        let caller = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let stale = cache.lookup("upstream.local").await.unwrap();
                assert_eq!(stale, ips(&["10.0.0.1"]));
                std::future::pending::<()>().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(resolver.calls(), 2);
        assert_eq!(
            cache.peek("upstream.local").unwrap().addresses,
            ips(&["10.0.0.9"])
        );
    }

    #[tokio::test]
    async fn test_stale_record_served_and_refreshed_once() {
        let resolver = CountingResolver::new(&["10.0.0.1"], Duration::from_millis(50));
        let cache = cache(resolver.clone(), Duration::from_millis(200));

        cache.lookup("upstream.local").await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        resolver.set(&["10.0.0.9"]);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.lookup("upstream.local").await })
            })
            .collect();

        for handle in handles {
            // Stale answer, returned without waiting on the resolver.
            assert_eq!(handle.await.unwrap().unwrap(), ips(&["10.0.0.1"]));
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(resolver.calls(), 2);
        assert_eq!(cache.lookup("upstream.local").await.unwrap(), ips(&["10.0.0.9"]));
    }

    #[tokio::test]
    async fn test_stale_record_kept_when_refresh_fails() {
        let resolver = CountingResolver::new(&["10.0.0.1"], Duration::ZERO);
        let cache = cache(resolver.clone(), Duration::from_millis(50));

        cache.lookup("upstream.local").await.unwrap();
        resolver.fail();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(cache.lookup("upstream.local").await.unwrap(), ips(&["10.0.0.1"]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.lookup("upstream.local").await.unwrap(), ips(&["10.0.0.1"]));
        assert!(resolver.calls() >= 2);
    }

    #[tokio::test]
    async fn test_refresh_clears_unused() {
        let resolver = CountingResolver::new(&["10.0.0.1"], Duration::ZERO);
        let cache = cache(resolver.clone(), Duration::from_secs(60));

        cache.lookup("a.local").await.unwrap();
        cache.lookup("b.local").await.unwrap();

        // Both were used since creation: refreshed, not evicted.
        cache.refresh(true).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(resolver.calls(), 4);

        cache.lookup("a.local").await.unwrap();
        cache.refresh(true).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.peek("a.local").is_some());
        assert!(cache.peek("b.local").is_none());
    }

    #[tokio::test]
    async fn test_refresh_replaces_record() {
        let resolver = CountingResolver::new(&["10.0.0.1"], Duration::ZERO);
        let cache = cache(resolver.clone(), Duration::from_secs(60));

        cache.lookup("upstream.local").await.unwrap();
        let before = cache.peek("upstream.local").unwrap();

        resolver.set(&["10.0.0.2", "10.0.0.3"]);
        cache.refresh(false).await;

        let after = cache.peek("upstream.local").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.addresses, ips(&["10.0.0.1"]));
        assert_eq!(after.addresses, ips(&["10.0.0.2", "10.0.0.3"]));
    }
}
