//! Locator cache: resolution of indirect references.
//!
//! A [`Reference`] names an object either directly by endpoints, indirectly
//! by object adapter location, or as a well-known object found by identity.
//! Well-known references resolve in two hops (identity to location, location
//! to endpoints), so the cache keeps two tables. Each table de-duplicates
//! concurrent lookups for the same key and may serve stale entries while a
//! refresh runs in the background.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::LocatorCacheOptions;
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::protocol::Protocol;

/// Object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Optional category.
    pub category: String,
    /// Object name.
    pub name: String,
}

impl Identity {
    /// Identity without a category.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            category: String::new(),
            name: name.into(),
        }
    }

    /// Identity with a category.
    pub fn with_category(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// How a reference reaches its object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Found by identity through the locator.
    WellKnown,
    /// Hosted by the named object adapter.
    Location(String),
    /// Reachable at these endpoints.
    Direct(Vec<Endpoint>),
}

/// A reference to a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Object identity.
    pub identity: Identity,
    /// How the object is reached.
    pub target: Target,
    /// Protocol the reference uses.
    pub protocol: Protocol,
}

impl Reference {
    /// Direct reference.
    pub fn direct(identity: Identity, endpoints: Vec<Endpoint>, protocol: Protocol) -> Self {
        Self {
            identity,
            target: Target::Direct(endpoints),
            protocol,
        }
    }

    /// Reference resolved through an adapter location.
    pub fn located(identity: Identity, adapter_id: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            identity,
            target: Target::Location(adapter_id.into()),
            protocol,
        }
    }

    /// Well-known reference.
    pub fn well_known(identity: Identity, protocol: Protocol) -> Self {
        Self {
            identity,
            target: Target::WellKnown,
            protocol,
        }
    }

    /// Endpoints of a direct reference.
    pub fn endpoints(&self) -> Option<&[Endpoint]> {
        match &self.target {
            Target::Direct(endpoints) => Some(endpoints),
            _ => None,
        }
    }

    fn is_direct(&self) -> bool {
        matches!(&self.target, Target::Direct(endpoints) if !endpoints.is_empty())
    }
}

/// The remote locator service.
#[async_trait]
pub trait Locator: Send + Sync {
    /// Resolve a well-known object. Returns a direct or location reference.
    async fn find_object_by_id(
        &self,
        identity: &Identity,
        protocol: Protocol,
    ) -> Result<Option<Reference>>;

    /// Resolve an object adapter to a direct reference.
    async fn find_adapter_by_id(
        &self,
        adapter_id: &str,
        protocol: Protocol,
    ) -> Result<Option<Reference>>;
}

/// Cache lifetime of resolved references.
///
/// Configured in seconds: `0` disables caching, a negative value never
/// expires entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "i64")]
pub enum Ttl {
    /// Always resolve live.
    Disabled,
    /// Entries are fresh for this long.
    Finite(Duration),
    /// Entries never age out.
    #[default]
    Infinite,
}

impl From<i64> for Ttl {
    fn from(seconds: i64) -> Self {
        match seconds {
            0 => Ttl::Disabled,
            s if s < 0 => Ttl::Infinite,
            s => Ttl::Finite(Duration::from_secs(s as u64)),
        }
    }
}

impl Ttl {
    fn is_fresh(self, inserted: Instant) -> bool {
        match self {
            Ttl::Disabled => false,
            Ttl::Finite(ttl) => inserted.elapsed() < ttl,
            Ttl::Infinite => true,
        }
    }
}

type Lookup = Result<Option<Reference>>;
type LookupReceiver = watch::Receiver<Option<Lookup>>;

struct CacheEntry {
    reference: Reference,
    inserted: Instant,
}

/// One cache plus its in-flight request map.
struct Table<K> {
    name: &'static str,
    entries: Mutex<HashMap<K, CacheEntry>>,
    requests: Mutex<HashMap<K, LookupReceiver>>,
}

impl<K: Hash + Eq + Clone> Table<K> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, CacheEntry>> {
        lock(&self.entries)
    }

    /// Cached reference and whether it is still fresh.
    fn get(&self, key: &K, ttl: Ttl) -> Option<(Reference, bool)> {
        if ttl == Ttl::Disabled {
            return None;
        }
        self.entries()
            .get(key)
            .map(|entry| (entry.reference.clone(), ttl.is_fresh(entry.inserted)))
    }

    fn remove(&self, key: &K) {
        self.entries().remove(key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WellKnownKey(Identity, Protocol);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LocationKey(String, Protocol);

/// A lookup one of the tables can perform.
#[async_trait]
trait Resolvable: fmt::Debug + Hash + Eq + Clone + Send + Sync + 'static {
    fn table(cache: &CacheInner) -> &Table<Self>;

    async fn fetch(&self, locator: &dyn Locator) -> Lookup;

    fn is_valid(&self, reference: &Reference) -> bool;
}

#[async_trait]
impl Resolvable for WellKnownKey {
    fn table(cache: &CacheInner) -> &Table<Self> {
        &cache.well_known
    }

    async fn fetch(&self, locator: &dyn Locator) -> Lookup {
        locator.find_object_by_id(&self.0, self.1).await
    }

    fn is_valid(&self, reference: &Reference) -> bool {
        reference.protocol == self.1
            && (reference.is_direct() || matches!(reference.target, Target::Location(_)))
    }
}

#[async_trait]
impl Resolvable for LocationKey {
    fn table(cache: &CacheInner) -> &Table<Self> {
        &cache.location
    }

    async fn fetch(&self, locator: &dyn Locator) -> Lookup {
        locator.find_adapter_by_id(&self.0, self.1).await
    }

    fn is_valid(&self, reference: &Reference) -> bool {
        reference.protocol == self.1 && reference.is_direct()
    }
}

struct CacheInner {
    locator: Arc<dyn Locator>,
    options: LocatorCacheOptions,
    well_known: Table<WellKnownKey>,
    location: Table<LocationKey>,
}

impl CacheInner {
    /// Cached-or-single-flight lookup in the key's table.
    async fn resolve<K: Resolvable>(self: &Arc<Self>, key: K, ttl: Ttl) -> Result<(Option<Reference>, bool)> {
        let table = K::table(self);
        if let Some((reference, fresh)) = table.get(&key, ttl) {
            if fresh {
                return Ok((Some(reference), true));
            }
            if self.options.background_refresh {
                tracing::trace!(table = table.name, ?key, "serving stale entry while refreshing");
                drop(self.request(key));
                return Ok((Some(reference), true));
            }
        }

        let mut lookup = self.request(key);
        let result = match lookup.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        let result = result.unwrap_or_else(|| {
            Err(RpcError::ResolutionFailed("lookup ended without a result".to_string()))
        })?;
        Ok((result, false))
    }

    /// Join the in-flight lookup for `key` or start one.
    fn request<K: Resolvable>(self: &Arc<Self>, key: K) -> LookupReceiver {
        let table = K::table(self);
        let mut requests = lock(&table.requests);
        if let Some(lookup) = requests.get(&key) {
            return lookup.clone();
        }
        let (tx, rx) = watch::channel(None);
        requests.insert(key.clone(), rx.clone());
        drop(requests);

        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.fetch(&key).await;
            let table = K::table(&inner);
            match &result {
                Ok(Some(reference)) => {
                    table.entries().insert(
                        key.clone(),
                        CacheEntry {
                            reference: reference.clone(),
                            inserted: Instant::now(),
                        },
                    );
                }
                Ok(None) => table.remove(&key),
                Err(err) => {
                    tracing::debug!(table = table.name, ?key, error = %err, "locator lookup failed");
                }
            }
            lock(&table.requests).remove(&key);
            tx.send_replace(Some(result));
        });
        rx
    }

    async fn fetch<K: Resolvable>(&self, key: &K) -> Lookup {
        let Some(reference) = key.fetch(self.locator.as_ref()).await? else {
            tracing::debug!(?key, "locator has no entry");
            return Ok(None);
        };
        if !key.is_valid(&reference) {
            tracing::warn!(?key, ?reference, "ignoring invalid locator result");
            return Ok(None);
        }
        Ok(Some(reference))
    }
}

/// Caches locator lookups for indirect references.
#[derive(Clone)]
pub struct LocatorCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for LocatorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocatorCache")
            .field("well_known", &self.inner.well_known.entries().len())
            .field("location", &self.inner.location.entries().len())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl LocatorCache {
    /// Create a cache in front of `locator`.
    pub fn new(locator: Arc<dyn Locator>, options: LocatorCacheOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                locator,
                options,
                well_known: Table::new("well-known"),
                location: Table::new("location"),
            }),
        }
    }

    /// Resolve with the configured default TTL.
    pub async fn resolve(&self, reference: &Reference) -> Result<(Option<Reference>, bool)> {
        self.resolve_indirect(reference, self.inner.options.ttl).await
    }

    /// Resolve `reference` to a direct reference.
    ///
    /// Returns the direct reference, or `None` when the object cannot be
    /// found, and whether every hop was answered from the cache. Direct
    /// references are returned unchanged.
    pub async fn resolve_indirect(
        &self,
        reference: &Reference,
        ttl: Ttl,
    ) -> Result<(Option<Reference>, bool)> {
        let protocol = reference.protocol;
        let adapter_id = match &reference.target {
            Target::Direct(_) => return Ok((Some(reference.clone()), false)),
            Target::Location(adapter_id) => adapter_id.clone(),
            Target::WellKnown => {
                let key = WellKnownKey(reference.identity.clone(), protocol);
                let (resolved, well_known_cached) = self.inner.resolve(key.clone(), ttl).await?;
                let Some(resolved) = resolved else {
                    return Ok((None, well_known_cached));
                };
                let adapter_id = match resolved.target {
                    Target::Direct(endpoints) => {
                        return Ok((
                            Some(Reference::direct(reference.identity.clone(), endpoints, protocol)),
                            well_known_cached,
                        ));
                    }
                    Target::Location(adapter_id) => adapter_id,
                    Target::WellKnown => return Ok((None, false)),
                };

                let located = self
                    .inner
                    .resolve(LocationKey(adapter_id, protocol), ttl)
                    .await;
                return match located {
                    Ok((Some(direct), location_cached)) => Ok((
                        Some(Reference {
                            identity: reference.identity.clone(),
                            ..direct
                        }),
                        well_known_cached && location_cached,
                    )),
                    Ok((None, _)) => {
                        self.inner.well_known.remove(&key);
                        Ok((None, false))
                    }
                    Err(err) => {
                        self.inner.well_known.remove(&key);
                        Err(err)
                    }
                };
            }
        };

        let (direct, cached) = self
            .inner
            .resolve(LocationKey(adapter_id, protocol), ttl)
            .await?;
        let direct = direct.map(|direct| Reference {
            identity: reference.identity.clone(),
            ..direct
        });
        Ok((direct, cached))
    }

    /// Forget the cached resolution of a well-known object.
    pub fn clear_well_known(&self, identity: &Identity, protocol: Protocol) {
        self.inner
            .well_known
            .remove(&WellKnownKey(identity.clone(), protocol));
    }

    /// Forget the cached endpoints of an adapter.
    pub fn clear_location(&self, adapter_id: &str, protocol: Protocol) {
        self.inner
            .location
            .remove(&LocationKey(adapter_id.to_string(), protocol));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeLocator {
        objects: Mutex<HashMap<String, Reference>>,
        adapters: Mutex<HashMap<String, Result<Option<Reference>>>>,
        object_calls: AtomicUsize,
        adapter_calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeLocator {
        fn set_adapter(&self, adapter_id: &str, result: Result<Option<Reference>>) {
            lock(&self.adapters).insert(adapter_id.to_string(), result);
        }

        fn set_object(&self, name: &str, reference: Reference) {
            lock(&self.objects).insert(name.to_string(), reference);
        }
    }

    #[async_trait]
    impl Locator for FakeLocator {
        async fn find_object_by_id(
            &self,
            identity: &Identity,
            _protocol: Protocol,
        ) -> Result<Option<Reference>> {
            self.object_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(lock(&self.objects).get(&identity.name).cloned())
        }

        async fn find_adapter_by_id(
            &self,
            adapter_id: &str,
            _protocol: Protocol,
        ) -> Result<Option<Reference>> {
            self.adapter_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            lock(&self.adapters).get(adapter_id).cloned().unwrap_or(Ok(None))
        }
    }

    fn direct(port: u16) -> Reference {
        Reference::direct(
            Identity::new("adapter"),
            vec![Endpoint::tcp("h", port)],
            Protocol::V2,
        )
    }

    fn located(adapter: &str) -> Reference {
        Reference::located(Identity::new("hello"), adapter, Protocol::V2)
    }

    fn cache(locator: &Arc<FakeLocator>, options: LocatorCacheOptions) -> LocatorCache {
        LocatorCache::new(locator.clone(), options)
    }

    #[test]
    fn test_ttl_from_seconds() {
        assert_eq!(Ttl::from(0), Ttl::Disabled);
        assert_eq!(Ttl::from(-1), Ttl::Infinite);
        assert_eq!(Ttl::from(5), Ttl::Finite(Duration::from_secs(5)));
        assert_eq!(Ttl::default(), Ttl::Infinite);
    }

    #[tokio::test]
    async fn test_location_lookup_is_cached() {
        let locator = Arc::new(FakeLocator::default());
        locator.set_adapter("a1", Ok(Some(direct(1))));
        let cache = cache(&locator, LocatorCacheOptions::default());

        let (first, cached) = cache.resolve(&located("a1")).await.unwrap();
        assert!(!cached);
        let first = first.unwrap();
        assert_eq!(first.identity, Identity::new("hello"));
        assert_eq!(first.endpoints().unwrap(), &[Endpoint::tcp("h", 1)]);

        let (second, cached) = cache.resolve(&located("a1")).await.unwrap();
        assert!(cached);
        assert_eq!(second.unwrap(), first);
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_ttl_always_resolves() {
        let locator = Arc::new(FakeLocator::default());
        locator.set_adapter("a1", Ok(Some(direct(1))));
        let cache = cache(&locator, LocatorCacheOptions::default());

        for _ in 0..3 {
            let (resolved, cached) = cache
                .resolve_indirect(&located("a1"), Ttl::Disabled)
                .await
                .unwrap();
            assert!(resolved.is_some());
            assert!(!cached);
        }
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_ttl_expires() {
        let locator = Arc::new(FakeLocator::default());
        locator.set_adapter("a1", Ok(Some(direct(1))));
        let ttl = Ttl::Finite(Duration::from_secs(10));
        let cache = cache(&locator, LocatorCacheOptions::default());

        cache.resolve_indirect(&located("a1"), ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.resolve_indirect(&located("a1"), ttl).await.unwrap().1);

        tokio::time::advance(Duration::from_secs(6)).await;
        locator.set_adapter("a1", Ok(Some(direct(2))));
        let (resolved, cached) = cache.resolve_indirect(&located("a1"), ttl).await.unwrap();
        assert!(!cached);
        assert_eq!(resolved.unwrap().endpoints().unwrap(), &[Endpoint::tcp("h", 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_ttl_never_expires() {
        let locator = Arc::new(FakeLocator::default());
        locator.set_adapter("a1", Ok(Some(direct(1))));
        let cache = cache(&locator, LocatorCacheOptions::default().ttl(Ttl::Infinite));

        cache.resolve(&located("a1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        let (resolved, cached) = cache.resolve(&located("a1")).await.unwrap();
        assert!(cached);
        assert!(resolved.is_some());
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 1);

        cache.clear_location("a1", Protocol::V2);
        assert!(!cache.resolve(&located("a1")).await.unwrap().1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_serves_stale() {
        let locator = Arc::new(FakeLocator::default());
        locator.set_adapter("a1", Ok(Some(direct(1))));
        let options = LocatorCacheOptions::default()
            .ttl(Ttl::Finite(Duration::from_secs(1)))
            .background_refresh(true);
        let cache = cache(&locator, options);

        cache.resolve(&located("a1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        locator.set_adapter("a1", Ok(Some(direct(2))));

        let (stale, cached) = cache.resolve(&located("a1")).await.unwrap();
        assert!(cached);
        assert_eq!(stale.unwrap().endpoints().unwrap(), &[Endpoint::tcp("h", 1)]);

        // Let the refresh task run.
        while locator.adapter_calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        let (fresh, cached) = cache.resolve(&located("a1")).await.unwrap();
        assert!(cached);
        assert_eq!(fresh.unwrap().endpoints().unwrap(), &[Endpoint::tcp("h", 2)]);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_request() {
        let locator = Arc::new(FakeLocator {
            delay: Some(Duration::from_millis(20)),
            ..FakeLocator::default()
        });
        locator.set_adapter("a1", Ok(Some(direct(1))));
        let cache = cache(&locator, LocatorCacheOptions::default());

        let reference = located("a1");
        let (a, b, c) = tokio::join!(
            cache.resolve(&reference),
            cache.resolve(&reference),
            cache.resolve(&reference),
        );
        assert!(a.unwrap().0.is_some() && b.unwrap().0.is_some() && c.unwrap().0.is_some());
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_well_known_resolves_in_two_hops() {
        let locator = Arc::new(FakeLocator::default());
        locator.set_object("hello", located("a1"));
        locator.set_adapter("a1", Ok(Some(direct(1))));
        let cache = cache(&locator, LocatorCacheOptions::default());
        let reference = Reference::well_known(Identity::new("hello"), Protocol::V2);

        let (resolved, cached) = cache.resolve(&reference).await.unwrap();
        assert!(!cached);
        let resolved = resolved.unwrap();
        assert_eq!(resolved.identity, Identity::new("hello"));
        assert_eq!(resolved.endpoints().unwrap(), &[Endpoint::tcp("h", 1)]);

        assert!(cache.resolve(&reference).await.unwrap().1);

        // Only the location hop was dropped: the result is partly cached.
        cache.clear_location("a1", Protocol::V2);
        assert!(!cache.resolve(&reference).await.unwrap().1);
        assert_eq!(locator.object_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_location_evicts_well_known_entry() {
        let locator = Arc::new(FakeLocator::default());
        locator.set_object("hello", located("a1"));
        locator.set_adapter("a1", Ok(Some(direct(1))));
        let cache = cache(&locator, LocatorCacheOptions::default());
        let reference = Reference::well_known(Identity::new("hello"), Protocol::V2);
        cache.resolve(&reference).await.unwrap();

        cache.clear_location("a1", Protocol::V2);
        locator.set_adapter(
            "a1",
            Err(RpcError::ResolutionFailed("adapter gone".to_string())),
        );
        assert!(cache.resolve(&reference).await.is_err());

        // The well-known hop is resolved again.
        locator.set_adapter("a1", Ok(Some(direct(3))));
        let (resolved, cached) = cache.resolve(&reference).await.unwrap();
        assert!(!cached);
        assert!(resolved.is_some());
        assert_eq!(locator.object_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_results_are_not_cached() {
        let locator = Arc::new(FakeLocator::default());
        let mut wrong_protocol = direct(1);
        wrong_protocol.protocol = Protocol::V1;
        locator.set_adapter("a1", Ok(Some(wrong_protocol)));
        locator.set_adapter("a2", Ok(Some(located("a3"))));
        let cache = cache(&locator, LocatorCacheOptions::default());

        assert_eq!(cache.resolve(&located("a1")).await.unwrap(), (None, false));
        assert_eq!(cache.resolve(&located("a1")).await.unwrap(), (None, false));
        assert_eq!(cache.resolve(&located("a2")).await.unwrap(), (None, false));
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_direct_reference_passes_through() {
        let locator = Arc::new(FakeLocator::default());
        let cache = cache(&locator, LocatorCacheOptions::default());
        let (resolved, cached) = cache.resolve(&direct(7)).await.unwrap();
        assert_eq!(resolved, Some(direct(7)));
        assert!(!cached);
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 0);
    }
}
