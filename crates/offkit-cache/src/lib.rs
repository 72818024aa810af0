//! # Offkit Cache
//!
//! Named response-cache partitions for the offline worker.
//!
//! ## Features
//!
//! - **Partitions**: named, insertion-ordered key → response containers,
//!   created lazily on first open
//! - **Matching**: per-partition lookup and cross-partition fallback lookup
//! - **Bulk population**: fetch a manifest through the [`Fetch`] seam and
//!   commit all of it in one step, or none of it
//! - **Quota model**: partition and per-partition entry limits, plus a
//!   disabled mode that refuses every write
//!
//! ## Architecture
//!
//! ```text
//! PartitionStore
//!     │
//!     ├── Partition "static-v1"
//!     │       └── RequestKey → StoredResponse
//!     │
//!     └── Partition "dynamic-v1"
//!             └── RequestKey → StoredResponse
//! ```
//!
//! The store is the single owner of every partition. Callers share it via
//! `Arc` and go through the async API; per-key operations are atomic behind
//! one `RwLock`.

use futures::future;
use hashbrown::{HashMap, HashSet};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use bytes::Bytes;
use offkit_common::epoch_millis;
use offkit_net::{Fetch, FetchError, Request, Response};

// ==================== Errors ====================

/// Partition store errors.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The store refused an open or a write: disabled, or over quota.
    #[error("storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    /// Bulk population aborted; nothing was committed.
    #[error("failed to populate cache for {url}")]
    PopulateFailed {
        url: String,
        #[source]
        source: FetchError,
    },
}

// ==================== Types ====================

/// Identity of a cached response: method plus full URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.to_string(),
        }
    }

    /// Key for a GET of the given URL.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key under which a request would be cached.
    pub fn of(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Immutable snapshot of a fetched response.
///
/// Bodies are owned and header values are stored as strings, so a snapshot
/// survives the live response and serializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// When the snapshot was taken, in milliseconds since the Unix epoch.
    pub stored_at: u64,
}

impl StoredResponse {
    /// Snapshot a live response. Header values that are not valid UTF-8
    /// are dropped.
    pub fn from_response(response: &Response) -> Self {
        let mut headers = HashMap::new();
        for (name, value) in response.headers.iter() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        Self {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            stored_at: epoch_millis(),
        }
    }

    /// Rebuild a live response from the snapshot.
    ///
    /// Returns `None` when the stored URL or status no longer parses;
    /// callers treat that as a cache miss.
    pub fn to_response(&self) -> Option<Response> {
        let url = Url::parse(&self.url).ok()?;
        let status = StatusCode::from_u16(self.status).ok()?;
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).ok();
            let value = HeaderValue::from_str(value).ok();
            if let (Some(name), Some(value)) = (name, value) {
                headers.insert(name, value);
            }
        }
        Some(Response {
            url,
            status,
            headers,
            body: Bytes::from(self.body.clone()),
        })
    }
}

// ==================== Partition ====================

/// One named cache: an insertion-ordered map of keys to snapshots.
///
/// Overwriting an existing key keeps its original position.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    entries: HashMap<RequestKey, StoredResponse>,
    order: Vec<RequestKey>,
}

impl Partition {
    pub fn get(&self, key: &RequestKey) -> Option<&StoredResponse> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: RequestKey, response: StoredResponse) {
        if self.entries.insert(key.clone(), response).is_none() {
            self.order.push(key);
        }
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> &[RequestKey] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Quota ====================

/// Capacity limits for a store. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreQuota {
    pub max_partitions: Option<usize>,
    pub max_entries_per_partition: Option<usize>,
}

impl StoreQuota {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn limited(max_partitions: usize, max_entries_per_partition: usize) -> Self {
        Self {
            max_partitions: Some(max_partitions),
            max_entries_per_partition: Some(max_entries_per_partition),
        }
    }
}

// ==================== PartitionStore ====================

#[derive(Debug, Default)]
struct StoreInner {
    partitions: HashMap<String, Partition>,
    /// Partition names in creation order.
    order: Vec<String>,
}

/// The cache partition store.
///
/// Interior-mutable; callers share it via `Arc`. Reads never fail: a
/// missing partition or key is a miss, not an error. Writes fail with
/// [`CacheError::StorageUnavailable`] when the store is disabled or a
/// quota would be exceeded.
#[derive(Debug)]
pub struct PartitionStore {
    inner: RwLock<StoreInner>,
    quota: StoreQuota,
    disabled: bool,
}

impl Default for PartitionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionStore {
    /// An enabled store with no quota.
    pub fn new() -> Self {
        Self::with_quota(StoreQuota::unlimited())
    }

    pub fn with_quota(quota: StoreQuota) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            quota,
            disabled: false,
        }
    }

    /// A store that refuses every open and write.
    ///
    /// Models hosts where the storage medium is unavailable: reads miss,
    /// writes fail, and callers have to survive on the network alone.
    pub fn disabled() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            quota: StoreQuota::unlimited(),
            disabled: true,
        }
    }

    fn ensure_enabled(&self) -> Result<(), CacheError> {
        if self.disabled {
            return Err(CacheError::StorageUnavailable {
                reason: "store is disabled".to_string(),
            });
        }
        Ok(())
    }

    fn open_locked<'a>(
        &self,
        inner: &'a mut StoreInner,
        name: &str,
    ) -> Result<&'a mut Partition, CacheError> {
        if !inner.partitions.contains_key(name) {
            if let Some(max) = self.quota.max_partitions {
                if inner.partitions.len() >= max {
                    return Err(CacheError::StorageUnavailable {
                        reason: format!("partition quota of {} reached", max),
                    });
                }
            }
            inner.order.push(name.to_string());
            debug!(partition = %name, "partition created");
        }
        Ok(inner.partitions.entry(name.to_string()).or_default())
    }

    /// Open a partition, creating it if needed. Idempotent.
    pub async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.ensure_enabled()?;
        let mut inner = self.inner.write().await;
        self.open_locked(&mut inner, name).map(|_| ())
    }

    /// Look a key up in one partition. A missing partition is a miss.
    pub async fn match_in(&self, name: &str, key: &RequestKey) -> Option<StoredResponse> {
        let inner = self.inner.read().await;
        inner.partitions.get(name).and_then(|p| p.get(key)).cloned()
    }

    /// Look a key up across every partition, in partition creation order.
    pub async fn match_any(&self, key: &RequestKey) -> Option<StoredResponse> {
        let inner = self.inner.read().await;
        for name in &inner.order {
            if let Some(response) = inner.partitions.get(name).and_then(|p| p.get(key)) {
                return Some(response.clone());
            }
        }
        None
    }

    /// Store a snapshot, opening the partition lazily. Overwrites an
    /// existing entry for the same key.
    pub async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        self.ensure_enabled()?;
        let mut inner = self.inner.write().await;
        let partition = self.open_locked(&mut inner, name)?;
        if let Some(max) = self.quota.max_entries_per_partition {
            if partition.get(&key).is_none() && partition.len() >= max {
                return Err(CacheError::StorageUnavailable {
                    reason: format!("entry quota of {} reached in '{}'", max, name),
                });
            }
        }
        debug!(partition = %name, key = %key, "response stored");
        partition.insert(key, response);
        Ok(())
    }

    /// Partition names in creation order.
    pub async fn list_names(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }

    /// Delete a partition and everything in it. Returns `false` when the
    /// partition does not exist.
    pub async fn delete(&self, name: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.partitions.remove(name).is_some();
        if removed {
            inner.order.retain(|n| n != name);
            debug!(partition = %name, "partition deleted");
        }
        removed
    }

    /// Fetch a manifest of requests concurrently and commit every snapshot
    /// to one partition in a single step.
    ///
    /// All-or-nothing: if any fetch fails or resolves with a non-2xx
    /// status, or the commit would exceed quota, nothing is retained.
    /// Returns the number of snapshots stored.
    pub async fn populate_all(
        &self,
        name: &str,
        requests: &[Request],
        fetcher: &dyn Fetch,
    ) -> Result<usize, CacheError> {
        self.ensure_enabled()?;

        let fetches = requests.iter().map(|request| async move {
            let url = request.url.to_string();
            let response = fetcher
                .fetch(request)
                .await
                .map_err(|source| CacheError::PopulateFailed {
                    url: url.clone(),
                    source,
                })?;
            if !response.ok() {
                return Err(CacheError::PopulateFailed {
                    url,
                    source: FetchError::RequestFailed(format!(
                        "unexpected status {}",
                        response.status
                    )),
                });
            }
            Ok((RequestKey::of(request), StoredResponse::from_response(&response)))
        });
        let entries = future::try_join_all(fetches).await?;

        let mut inner = self.inner.write().await;
        if let Some(max) = self.quota.max_entries_per_partition {
            let (current, incoming) = {
                let existing = inner.partitions.get(name);
                let mut incoming: HashSet<&RequestKey> = HashSet::new();
                for (key, _) in &entries {
                    if existing.map_or(true, |p| p.get(key).is_none()) {
                        incoming.insert(key);
                    }
                }
                (existing.map_or(0, Partition::len), incoming.len())
            };
            if current + incoming > max {
                return Err(CacheError::StorageUnavailable {
                    reason: format!("entry quota of {} reached in '{}'", max, name),
                });
            }
        }
        let partition = self.open_locked(&mut inner, name)?;
        let count = entries.len();
        for (key, response) in entries {
            partition.insert(key, response);
        }
        info!(partition = %name, entries = count, "partition populated");
        Ok(count)
    }

    /// Number of entries in a partition; 0 when it does not exist.
    pub async fn entry_count(&self, name: &str) -> usize {
        let inner = self.inner.read().await;
        inner.partitions.get(name).map_or(0, Partition::len)
    }

    /// Whether a partition exists.
    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.partitions.contains_key(name)
    }

    /// Keys of a partition in insertion order; empty when it does not exist.
    pub async fn keys(&self, name: &str) -> Vec<RequestKey> {
        let inner = self.inner.read().await;
        inner
            .partitions
            .get(name)
            .map_or_else(Vec::new, |p| p.keys().to_vec())
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use offkit_net::StaticFetcher;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn response(target: &str, status: u16, body: &str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        Response {
            url: url(target),
            status: StatusCode::from_u16(status).unwrap(),
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    fn snapshot(target: &str, body: &str) -> StoredResponse {
        StoredResponse::from_response(&response(target, 200, body))
    }

    fn key(target: &str) -> RequestKey {
        RequestKey::get(&url(target))
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let store = PartitionStore::new();
        store.open("static-v1").await.unwrap();
        store.open("static-v1").await.unwrap();

        assert_eq!(store.list_names().await, vec!["static-v1"]);
        assert!(store.contains("static-v1").await);
    }

    #[tokio::test]
    async fn test_missing_partition_is_a_miss() {
        let store = PartitionStore::new();
        assert!(store.match_in("nope", &key("https://a.test/")).await.is_none());
        assert!(store.match_any(&key("https://a.test/")).await.is_none());
    }

    #[tokio::test]
    async fn test_put_then_match_round_trips() {
        let store = PartitionStore::new();
        let target = "https://app.test/static/icon-192x192.png";
        store
            .put("static-v1", key(target), snapshot(target, "png bytes"))
            .await
            .unwrap();

        let stored = store.match_in("static-v1", &key(target)).await.unwrap();
        assert_eq!(stored.status, 200);
        assert_eq!(stored.body, b"png bytes");

        let live = stored.to_response().unwrap();
        assert_eq!(live.url, url(target));
        assert_eq!(live.status, StatusCode::OK);
        assert_eq!(live.header("content-type"), Some("text/plain"));
        assert_eq!(&live.body[..], b"png bytes");
    }

    #[tokio::test]
    async fn test_deleted_partition_never_matches() {
        let store = PartitionStore::new();
        let target = "https://app.test/recipes";
        store
            .put("recipes-v1", key(target), snapshot(target, "list"))
            .await
            .unwrap();

        assert!(store.delete("recipes-v1").await);
        assert!(store.match_in("recipes-v1", &key(target)).await.is_none());
        assert!(store.match_any(&key(target)).await.is_none());
        assert!(!store.contains("recipes-v1").await);

        // Second delete is a no-op.
        assert!(!store.delete("recipes-v1").await);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_insertion_position() {
        let store = PartitionStore::new();
        for target in ["https://a.test/1", "https://a.test/2", "https://a.test/3"] {
            store
                .put("dynamic-v1", key(target), snapshot(target, "old"))
                .await
                .unwrap();
        }
        store
            .put("dynamic-v1", key("https://a.test/2"), snapshot("https://a.test/2", "new"))
            .await
            .unwrap();

        let keys = store.keys("dynamic-v1").await;
        let urls: Vec<&str> = keys.iter().map(|k| k.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.test/1", "https://a.test/2", "https://a.test/3"]);

        let stored = store
            .match_in("dynamic-v1", &key("https://a.test/2"))
            .await
            .unwrap();
        assert_eq!(stored.body, b"new");
    }

    #[tokio::test]
    async fn test_match_any_prefers_earliest_partition() {
        let store = PartitionStore::new();
        let target = "https://app.test/shared";
        store
            .put("first", key(target), snapshot(target, "from first"))
            .await
            .unwrap();
        store
            .put("second", key(target), snapshot(target, "from second"))
            .await
            .unwrap();

        let stored = store.match_any(&key(target)).await.unwrap();
        assert_eq!(stored.body, b"from first");
    }

    #[tokio::test]
    async fn test_list_names_in_creation_order() {
        let store = PartitionStore::new();
        for name in ["recipes-v1", "static-v1", "dynamic-v1"] {
            store.open(name).await.unwrap();
        }
        assert_eq!(
            store.list_names().await,
            vec!["recipes-v1", "static-v1", "dynamic-v1"]
        );
    }

    #[tokio::test]
    async fn test_partition_quota() {
        let store = PartitionStore::with_quota(StoreQuota::limited(1, 10));
        store.open("static-v1").await.unwrap();

        let err = store.open("dynamic-v1").await.unwrap_err();
        assert!(matches!(err, CacheError::StorageUnavailable { .. }));

        // Re-opening an existing partition is still fine.
        store.open("static-v1").await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_quota_allows_overwrite() {
        let store = PartitionStore::with_quota(StoreQuota::limited(10, 1));
        let first = "https://a.test/1";
        store.put("p", key(first), snapshot(first, "a")).await.unwrap();

        let err = store
            .put("p", key("https://a.test/2"), snapshot("https://a.test/2", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::StorageUnavailable { .. }));

        // Same key does not grow the partition.
        store.put("p", key(first), snapshot(first, "a2")).await.unwrap();
        assert_eq!(store.entry_count("p").await, 1);
    }

    #[tokio::test]
    async fn test_disabled_store_refuses_writes() {
        let store = PartitionStore::disabled();
        let target = "https://a.test/";

        assert!(store.open("static-v1").await.is_err());
        assert!(store
            .put("static-v1", key(target), snapshot(target, "x"))
            .await
            .is_err());

        let fetcher = StaticFetcher::new();
        let err = store
            .populate_all("static-v1", &[Request::get(url(target))], &fetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::StorageUnavailable { .. }));
        assert!(store.match_in("static-v1", &key(target)).await.is_none());
    }

    #[tokio::test]
    async fn test_populate_all_commits_every_entry() {
        let store = PartitionStore::new();
        let fetcher = StaticFetcher::new();
        fetcher.insert_get(url("https://app.test/"), "index").await;
        fetcher
            .insert_get(url("https://app.test/static/manifest.json"), "{}")
            .await;

        let requests = vec![
            Request::get(url("https://app.test/")),
            Request::get(url("https://app.test/static/manifest.json")),
        ];
        let count = store
            .populate_all("static-v1", &requests, &fetcher)
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(store.entry_count("static-v1").await, 2);
        let stored = store
            .match_in("static-v1", &key("https://app.test/"))
            .await
            .unwrap();
        assert_eq!(stored.body, b"index");
    }

    #[tokio::test]
    async fn test_populate_all_is_atomic_when_a_fetch_fails() {
        let store = PartitionStore::new();
        let fetcher = StaticFetcher::new();
        fetcher.insert_get(url("https://app.test/"), "index").await;
        // No route for the manifest; that fetch fails.

        let requests = vec![
            Request::get(url("https://app.test/")),
            Request::get(url("https://app.test/static/manifest.json")),
        ];
        let err = store
            .populate_all("static-v1", &requests, &fetcher)
            .await
            .unwrap_err();

        match err {
            CacheError::PopulateFailed { url, .. } => {
                assert_eq!(url, "https://app.test/static/manifest.json");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.entry_count("static-v1").await, 0);
        assert!(store.match_any(&key("https://app.test/")).await.is_none());
    }

    #[tokio::test]
    async fn test_populate_all_rejects_non_2xx() {
        let store = PartitionStore::new();
        let fetcher = StaticFetcher::new();
        fetcher
            .insert(Method::GET, url("https://app.test/gone"), 404, "missing")
            .await;

        let err = store
            .populate_all("static-v1", &[Request::get(url("https://app.test/gone"))], &fetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::PopulateFailed { .. }));
        assert_eq!(store.entry_count("static-v1").await, 0);
    }

    #[tokio::test]
    async fn test_populate_all_respects_entry_quota() {
        let store = PartitionStore::with_quota(StoreQuota::limited(10, 1));
        let fetcher = StaticFetcher::new();
        fetcher.insert_get(url("https://app.test/a"), "a").await;
        fetcher.insert_get(url("https://app.test/b"), "b").await;

        let requests = vec![
            Request::get(url("https://app.test/a")),
            Request::get(url("https://app.test/b")),
        ];
        let err = store
            .populate_all("static-v1", &requests, &fetcher)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::StorageUnavailable { .. }));
        assert_eq!(store.entry_count("static-v1").await, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stored = snapshot("https://app.test/recipes", "body");
        let json = serde_json::to_string(&stored).unwrap();
        let back: StoredResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.url, stored.url);
        assert_eq!(back.status, 200);
        assert_eq!(back.body, stored.body);
    }
}
