//! In-memory transport for tests and offline hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::RwLock;
use url::Url;

use crate::{Fetch, FetchError, FetchResult, Request, Response};

#[derive(Debug, Clone)]
struct StubRoute {
    status: StatusCode,
    body: Bytes,
}

/// A [`Fetch`] implementation that serves a fixed route table.
///
/// Routes are keyed by method + URL. The fetcher can be switched offline at
/// runtime, after which every fetch fails the way a dead network would;
/// tests use that to force the fallback paths of the caching strategies.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    routes: RwLock<HashMap<String, StubRoute>>,
    offline: AtomicBool,
    calls: AtomicU64,
}

impl StaticFetcher {
    /// Create an online fetcher with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route, replacing any previous entry for the same
    /// method + URL.
    pub async fn insert(&self, method: Method, url: Url, status: u16, body: impl Into<Bytes>) {
        let route = StubRoute {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: body.into(),
        };
        self.routes
            .write()
            .await
            .insert(route_key(&method, &url), route);
    }

    /// Register a 200 GET route.
    pub async fn insert_get(&self, url: Url, body: impl Into<Bytes>) {
        self.insert(Method::GET, url, 200, body).await;
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::Relaxed);
    }

    /// Number of fetches attempted so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

fn route_key(method: &Method, url: &Url) -> String {
    format!("{} {}", method, url)
}

impl Fetch for StaticFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, FetchResult> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::Relaxed);

            if self.offline.load(Ordering::Relaxed) {
                return Err(FetchError::Offline);
            }

            let key = route_key(&request.method, &request.url);
            let route = self.routes.read().await.get(&key).cloned();
            match route {
                Some(route) => Ok(Response {
                    url: request.url.clone(),
                    status: route.status,
                    headers: HeaderMap::new(),
                    body: route.body,
                }),
                None => Err(FetchError::RequestFailed(format!("no stub route for {}", key))),
            }
        })
    }
}
