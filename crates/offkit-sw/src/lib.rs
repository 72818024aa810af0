//! # Offkit Service Worker
//!
//! Offline-first request interception for applications that must keep
//! working when the network does not.
//!
//! ## Features
//!
//! - **Classification**: URL-path rules map each request to a strategy
//! - **Strategies**: cache-first, network-first, stale-while-revalidate
//! - **Lifecycle**: install-time precache, activate-time pruning of
//!   orphaned partitions, client claiming
//! - **Background sync**: replay of writes deferred while offline
//! - **Status protocol**: online/offline reports for interested pages
//!
//! ## Architecture
//!
//! ```text
//! on_fetch(request)
//!     │
//!     ├── Classifier ──────── StrategyTag
//!     │
//!     └── strategy ──┬── PartitionStore   (offkit-cache)
//!                    └── Fetch            (offkit-net)
//! ```
//!
//! The worker is driven entirely by its host: one method per lifecycle
//! signal, no internal event loop. Detached work (revalidations, failed
//! background writes) reports through an optional event channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use http::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use offkit_cache::{CacheError, PartitionStore, RequestKey, StoredResponse};
use offkit_common::epoch_millis;
use offkit_net::{Fetch, FetchError, FetchResult, Request, Response};

pub mod classify;
pub mod clients;
pub mod relay;

pub use classify::{Classifier, PathRule, StrategyTag};
pub use clients::{Client, ClientRegistry};
pub use relay::{DeferredWrite, MemoryQueue, SyncOutcome, WriteQueue};

// ==================== Errors ====================

/// Worker errors.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Neither the network nor any cache could produce the resource.
    #[error("resource unavailable: {url}")]
    ResourceUnavailable { url: String },

    #[error("storage error: {0}")]
    Storage(#[from] CacheError),

    #[error("invalid precache path '{path}': {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: url::ParseError,
    },

    /// A lifecycle hook ran in a phase where it makes no sense.
    #[error("cannot {hook} while {phase:?}")]
    Lifecycle {
        hook: &'static str,
        phase: WorkerPhase,
    },
}

// ==================== Lifecycle ====================

/// Lifecycle phase of a worker version.
///
/// `New → Installing → Installed → Activating → Active`. A failed
/// install puts the worker back in `New`; there is no waiting phase,
/// an installed worker is immediately eligible for activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    New,
    Installing,
    Installed,
    Activating,
    Active,
}

// ==================== Configuration ====================

/// App-shell paths precached at install and served cache-first.
pub const APP_SHELL: [&str; 4] = [
    "/",
    "/static/manifest.json",
    "/static/icon-192x192.png",
    "/static/icon-512x512.png",
];

/// Background-sync tag that triggers a deferred-write replay.
pub const DEFAULT_SYNC_TAG: &str = "sync-writes";

/// Message payload that requests a status report.
pub const DEFAULT_STATUS_TOKEN: &str = "status-check";

/// The partition names one worker version owns, one per strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
    pub static_assets: String,
    pub dynamic: String,
    pub recipes: String,
}

impl PartitionNames {
    /// `static-vN` / `dynamic-vN` / `recipes-vN`.
    pub fn versioned(version: u32) -> Self {
        Self {
            static_assets: format!("static-v{}", version),
            dynamic: format!("dynamic-v{}", version),
            recipes: format!("recipes-v{}", version),
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.static_assets, &self.dynamic, &self.recipes]
    }
}

/// Immutable worker configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Origin against which precache paths are resolved.
    pub origin: Url,
    /// Version label for this worker, e.g. `"v1"`.
    pub version: String,
    /// Exact paths served cache-first.
    pub static_paths: Vec<String>,
    /// Paths fetched into the static partition at install.
    pub precache: Vec<String>,
    pub partitions: PartitionNames,
    pub sync_tag: String,
    pub status_token: String,
}

impl WorkerConfig {
    /// Standard configuration for one app version: the app shell is both
    /// the static-asset set and the precache manifest.
    pub fn new(origin: Url, version: u32) -> Self {
        let shell: Vec<String> = APP_SHELL.iter().map(|p| p.to_string()).collect();
        Self {
            origin,
            version: format!("v{}", version),
            static_paths: shell.clone(),
            precache: shell,
            partitions: PartitionNames::versioned(version),
            sync_tag: DEFAULT_SYNC_TAG.to_string(),
            status_token: DEFAULT_STATUS_TOKEN.to_string(),
        }
    }

    /// The partition a strategy reads and writes. Total: every tag has
    /// exactly one partition.
    pub fn partition_for(&self, tag: StrategyTag) -> &str {
        match tag {
            StrategyTag::CacheFirst => &self.partitions.static_assets,
            StrategyTag::NetworkFirst => &self.partitions.dynamic,
            StrategyTag::StaleWhileRevalidate => &self.partitions.recipes,
        }
    }

    /// Resolve the precache manifest against the origin.
    pub fn precache_requests(&self) -> Result<Vec<Request>, WorkerError> {
        self.precache
            .iter()
            .map(|path| {
                let url = self
                    .origin
                    .join(path)
                    .map_err(|source| WorkerError::InvalidPath {
                        path: path.clone(),
                        source,
                    })?;
                Ok(Request::get(url))
            })
            .collect()
    }
}

// ==================== Statistics ====================

/// Worker counters. Cheap atomics; read through [`WorkerStats::snapshot`].
#[derive(Debug, Default)]
pub struct WorkerStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    network_fetches: AtomicU64,
    network_failures: AtomicU64,
    fallback_hits: AtomicU64,
    revalidations: AtomicU64,
}

impl WorkerStats {
    fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_network_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_network_failure(&self) {
        self.network_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fallback_hit(&self) {
        self.fallback_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_revalidation(&self) {
        self.revalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            fallback_hits: self.fallback_hits.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub network_fetches: u64,
    pub network_failures: u64,
    pub fallback_hits: u64,
    pub revalidations: u64,
}

// ==================== Events ====================

/// Out-of-band outcome of detached or lifecycle work.
///
/// A fire-and-forget write must not leak its failure into the response
/// the caller is already holding; it surfaces here instead.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A best-effort cache write failed; the response was still served.
    CacheWriteFailed { url: String, error: String },
    /// A background revalidation fetched a fresh copy.
    Revalidated { url: String },
    /// A background revalidation could not produce a fresh copy.
    RevalidationFailed { url: String, error: String },
    /// An orphaned partition was deleted during activation.
    PartitionPruned { name: String },
    /// One deferred write could not be delivered.
    DeferredWriteFailed { endpoint: String, error: String },
    /// A sync signal finished replaying the queue.
    QueueReplayed { delivered: usize, failed: usize },
}

// ==================== Status protocol ====================

/// Answer to a status-check message, shaped for JSON transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub online: bool,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

// ==================== Tracked fetch ====================

/// Decorates the host's fetcher with the worker's bookkeeping: every
/// completed fetch updates the counters and the online flag, wherever
/// the fetch came from (strategy, install, replay).
#[derive(Clone)]
struct TrackedFetch {
    inner: Arc<dyn Fetch>,
    stats: Arc<WorkerStats>,
    online: Arc<AtomicBool>,
}

impl Fetch for TrackedFetch {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, FetchResult> {
        Box::pin(async move {
            match self.inner.fetch(request).await {
                Ok(response) => {
                    self.stats.record_network_fetch();
                    self.online.store(true, Ordering::Relaxed);
                    Ok(response)
                }
                Err(err) => {
                    self.stats.record_network_failure();
                    self.online.store(false, Ordering::Relaxed);
                    Err(err)
                }
            }
        })
    }
}

// ==================== OfflineWorker ====================

/// One version of the offline worker.
///
/// Hosts drive it through the lifecycle hooks; everything else is
/// internal. The worker is shared behind an `Arc` once configured.
pub struct OfflineWorker {
    config: WorkerConfig,
    classifier: Classifier,
    store: Arc<PartitionStore>,
    fetcher: TrackedFetch,
    queue: Arc<dyn WriteQueue>,
    clients: ClientRegistry,
    phase: RwLock<WorkerPhase>,
    online: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl OfflineWorker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<PartitionStore>,
        fetcher: Arc<dyn Fetch>,
        queue: Arc<dyn WriteQueue>,
    ) -> Self {
        let classifier = Classifier::new(config.static_paths.iter().cloned());
        let stats = Arc::new(WorkerStats::default());
        let online = Arc::new(AtomicBool::new(true));
        Self {
            classifier,
            config,
            store,
            fetcher: TrackedFetch {
                inner: fetcher,
                stats: Arc::clone(&stats),
                online: Arc::clone(&online),
            },
            queue,
            clients: ClientRegistry::new(),
            phase: RwLock::new(WorkerPhase::New),
            online,
            stats,
            events: None,
        }
    }

    /// Install a channel for out-of-band events. Call before sharing the
    /// worker; emission is best-effort.
    pub fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<WorkerEvent>) {
        self.events = Some(sender);
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Sessions this worker can claim; hosts register pages here.
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub async fn phase(&self) -> WorkerPhase {
        *self.phase.read().await
    }

    /// Last known connectivity, derived from fetch outcomes. Optimistic
    /// `true` until a fetch says otherwise.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn emit(&self, event: WorkerEvent) {
        send_event(&self.events, event);
    }

    // ---------- Lifecycle ----------

    /// Install this worker version: seed the static partition from the
    /// precache manifest. All-or-nothing; a failed install leaves no
    /// partial static cache and puts the phase back to `New`.
    pub async fn on_install(&self) -> Result<(), WorkerError> {
        {
            let mut phase = self.phase.write().await;
            if *phase != WorkerPhase::New {
                return Err(WorkerError::Lifecycle {
                    hook: "install",
                    phase: *phase,
                });
            }
            *phase = WorkerPhase::Installing;
        }
        info!(
            version = %self.config.version,
            partition = %self.config.partitions.static_assets,
            "installing"
        );

        let result = async {
            let requests = self.config.precache_requests()?;
            let count = self
                .store
                .populate_all(
                    &self.config.partitions.static_assets,
                    &requests,
                    &self.fetcher,
                )
                .await?;
            Ok::<usize, WorkerError>(count)
        }
        .await;

        let mut phase = self.phase.write().await;
        match result {
            Ok(count) => {
                *phase = WorkerPhase::Installed;
                info!(version = %self.config.version, entries = count, "install complete");
                Ok(())
            }
            Err(err) => {
                *phase = WorkerPhase::New;
                warn!(version = %self.config.version, error = %err, "install failed");
                Err(err)
            }
        }
    }

    /// Activate this worker version: delete every partition outside the
    /// current set, then claim all registered clients.
    pub async fn on_activate(&self) -> Result<(), WorkerError> {
        {
            let mut phase = self.phase.write().await;
            if *phase != WorkerPhase::Installed {
                return Err(WorkerError::Lifecycle {
                    hook: "activate",
                    phase: *phase,
                });
            }
            *phase = WorkerPhase::Activating;
        }

        let current = self.config.partitions.all();
        for name in self.store.list_names().await {
            if !current.contains(&name.as_str()) && self.store.delete(&name).await {
                info!(partition = %name, "orphaned partition pruned");
                self.emit(WorkerEvent::PartitionPruned { name });
            }
        }

        let claimed = self.clients.claim(&self.config.version).await;
        info!(version = %self.config.version, claimed, "activation complete");

        *self.phase.write().await = WorkerPhase::Active;
        Ok(())
    }

    // ---------- Fetch interception ----------

    /// Intercept one request and run the strategy its path classifies to.
    pub async fn on_fetch(&self, request: &Request) -> Result<Response, WorkerError> {
        let tag = self.classifier.classify(request);
        debug!(url = %request.url, strategy = %tag.as_str(), "request intercepted");
        match tag {
            StrategyTag::CacheFirst => self.cache_first(request).await,
            StrategyTag::NetworkFirst => self.network_first(request).await,
            StrategyTag::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        }
    }

    /// Best-effort cache write. Only successful responses are cached;
    /// a storage failure is reported, never propagated.
    async fn write_back(&self, partition: &str, request: &Request, response: &Response) {
        if !response.ok() {
            return;
        }
        let snapshot = StoredResponse::from_response(response);
        if let Err(err) = self
            .store
            .put(partition, RequestKey::of(request), snapshot)
            .await
        {
            warn!(partition = %partition, url = %request.url, error = %err, "cache write failed");
            self.emit(WorkerEvent::CacheWriteFailed {
                url: request.url.to_string(),
                error: err.to_string(),
            });
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<Response, WorkerError> {
        let partition = self.config.partition_for(StrategyTag::CacheFirst);
        let key = RequestKey::of(request);

        if let Some(response) = self
            .store
            .match_in(partition, &key)
            .await
            .and_then(|s| s.to_response())
        {
            self.stats.record_cache_hit();
            debug!(url = %request.url, "cache-first hit");
            return Ok(response);
        }

        self.stats.record_cache_miss();
        let response = self.fetcher.fetch(request).await.map_err(|err| {
            warn!(url = %request.url, error = %err, "cache-first miss and fetch failed");
            WorkerError::ResourceUnavailable {
                url: request.url.to_string(),
            }
        })?;
        self.write_back(partition, request, &response).await;
        Ok(response)
    }

    async fn network_first(&self, request: &Request) -> Result<Response, WorkerError> {
        let partition = self.config.partition_for(StrategyTag::NetworkFirst);

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.write_back(partition, request, &response).await;
                Ok(response)
            }
            Err(err) => {
                warn!(url = %request.url, error = %err, "network-first fetch failed, trying cache");
                let key = RequestKey::of(request);
                if let Some(response) = self
                    .store
                    .match_any(&key)
                    .await
                    .and_then(|s| s.to_response())
                {
                    self.stats.record_fallback_hit();
                    info!(url = %request.url, "served cached copy after network failure");
                    return Ok(response);
                }
                self.stats.record_cache_miss();
                Err(WorkerError::ResourceUnavailable {
                    url: request.url.to_string(),
                })
            }
        }
    }

    async fn stale_while_revalidate(&self, request: &Request) -> Result<Response, WorkerError> {
        let partition = self.config.partition_for(StrategyTag::StaleWhileRevalidate);
        let key = RequestKey::of(request);

        // The revalidation starts before the cache lookup and always runs
        // to completion; a cache hit only decides who waits for it.
        let network = self.spawn_revalidation(partition, request);

        if let Some(response) = self
            .store
            .match_in(partition, &key)
            .await
            .and_then(|s| s.to_response())
        {
            self.stats.record_cache_hit();
            debug!(url = %request.url, "serving cached copy while revalidating");
            return Ok(response);
        }

        self.stats.record_cache_miss();
        match network.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                warn!(url = %request.url, error = %err, "nothing cached and revalidation failed");
                Err(WorkerError::ResourceUnavailable {
                    url: request.url.to_string(),
                })
            }
            Err(_) => Err(WorkerError::ResourceUnavailable {
                url: request.url.to_string(),
            }),
        }
    }

    /// Fetch and store in a detached task. The receiver resolves once the
    /// storage side-effect has settled, so the miss path never races it.
    /// A non-2xx answer is reported as a failed revalidation and never
    /// stored; the miss path still receives it as the resolved response.
    fn spawn_revalidation(
        &self,
        partition: &str,
        request: &Request,
    ) -> oneshot::Receiver<Result<Response, FetchError>> {
        let (tx, rx) = oneshot::channel();
        let store = Arc::clone(&self.store);
        let fetcher = self.fetcher.clone();
        let stats = Arc::clone(&self.stats);
        let events = self.events.clone();
        let partition = partition.to_string();
        let request = request.clone();

        tokio::spawn(async move {
            let result = fetcher.fetch(&request).await;
            match &result {
                Ok(response) if response.ok() => {
                    let snapshot = StoredResponse::from_response(response);
                    if let Err(err) = store
                        .put(&partition, RequestKey::of(&request), snapshot)
                        .await
                    {
                        warn!(partition = %partition, url = %request.url, error = %err, "revalidation write failed");
                        send_event(
                            &events,
                            WorkerEvent::CacheWriteFailed {
                                url: request.url.to_string(),
                                error: err.to_string(),
                            },
                        );
                    }
                    stats.record_revalidation();
                    debug!(url = %request.url, "revalidated");
                    send_event(
                        &events,
                        WorkerEvent::Revalidated {
                            url: request.url.to_string(),
                        },
                    );
                }
                Ok(response) => {
                    warn!(url = %request.url, status = %response.status, "revalidation rejected");
                    send_event(
                        &events,
                        WorkerEvent::RevalidationFailed {
                            url: request.url.to_string(),
                            error: format!("endpoint answered {}", response.status),
                        },
                    );
                }
                Err(err) => {
                    warn!(url = %request.url, error = %err, "revalidation failed");
                    send_event(
                        &events,
                        WorkerEvent::RevalidationFailed {
                            url: request.url.to_string(),
                            error: err.to_string(),
                        },
                    );
                }
            }
            let _ = tx.send(result);
        });

        rx
    }

    // ---------- Background sync ----------

    /// Handle a background-sync signal. A recognized tag drains the
    /// deferred-write queue once and sends every item, in parallel, each
    /// exactly once. Failed items are reported, not re-enqueued.
    pub async fn on_sync(&self, tag: &str) -> Result<SyncOutcome, WorkerError> {
        if tag != self.config.sync_tag {
            debug!(tag = %tag, "unrecognized sync tag");
            return Ok(SyncOutcome::Ignored);
        }

        let writes = self.queue.drain().await;
        info!(tag = %tag, queued = writes.len(), "replaying deferred writes");

        let sends = writes.iter().map(|write| async move {
            match self.replay_write(write).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(endpoint = %write.endpoint, error = %err, "deferred write failed");
                    self.emit(WorkerEvent::DeferredWriteFailed {
                        endpoint: write.endpoint.clone(),
                        error: err.to_string(),
                    });
                    false
                }
            }
        });
        let results = future::join_all(sends).await;

        let delivered = results.iter().filter(|sent| **sent).count();
        let failed = results.len() - delivered;
        if failed > 0 {
            warn!(delivered, failed, "deferred writes replayed with failures");
        } else {
            info!(delivered, "deferred writes replayed");
        }
        self.emit(WorkerEvent::QueueReplayed { delivered, failed });
        Ok(SyncOutcome::Drained { delivered, failed })
    }

    /// One POST per deferred write. A non-2xx answer counts as a failed
    /// delivery; the endpoint rejected the write.
    async fn replay_write(&self, write: &DeferredWrite) -> Result<(), FetchError> {
        let url = Url::parse(&write.endpoint)
            .map_err(|_| FetchError::InvalidUrl(write.endpoint.clone()))?;
        let body = serde_json::to_vec(&write.payload)
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;
        let request = Request::post(url, Bytes::from(body)).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        let response = self.fetcher.fetch(&request).await?;
        if !response.ok() {
            return Err(FetchError::RequestFailed(format!(
                "endpoint answered {}",
                response.status
            )));
        }
        Ok(())
    }

    // ---------- Messages ----------

    /// Handle a page message. The status-check token yields a report;
    /// any other payload is not this worker's business.
    pub fn on_message(&self, payload: &str) -> Option<StatusReport> {
        if payload != self.config.status_token {
            return None;
        }
        let report = StatusReport {
            online: self.is_online(),
            timestamp_ms: epoch_millis(),
        };
        debug!(online = report.online, "status report requested");
        Some(report)
    }
}

fn send_event(events: &Option<mpsc::UnboundedSender<WorkerEvent>>, event: WorkerEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

// ==================== Tests ====================
