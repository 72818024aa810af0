//! # Offkit Net
//!
//! HTTP value types and the network seam for the offkit caching engine.
//!
//! ## Design Goals
//!
//! 1. **Owned snapshots**: responses carry fully buffered bodies so they can
//!    be stored and returned without a consume-once body
//! 2. **One seam**: everything that talks to the network goes through the
//!    [`Fetch`] trait, so hosts and tests can swap the transport
//! 3. **Plain types**: `http`/`url`/`bytes` vocabulary, nothing bespoke

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub mod client;
pub mod stub;

pub use client::{FetcherConfig, HttpFetcher};
pub use stub::StaticFetcher;

/// Errors surfaced by the network seam.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("No route to host (offline)")]
    Offline,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// An outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a POST request with a body.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: Some(body),
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// URL path component, the part request classification looks at.
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

/// A fully buffered HTTP response.
///
/// Cloning is cheap: the body is a refcounted [`Bytes`] buffer, so one
/// response can be stored in a cache partition and handed to the caller
/// without copying.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Check if the status is a success (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, FetchError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| FetchError::RequestFailed(e.to_string()))
    }

    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::RequestFailed(e.to_string()))
    }
}

/// Result of a network fetch.
pub type FetchResult = Result<Response, FetchError>;

/// The network seam.
///
/// Object-safe so callers can hold `Arc<dyn Fetch>` and tests can substitute
/// an in-memory transport such as [`StaticFetcher`].
pub trait Fetch: Send + Sync {
    /// Perform one HTTP exchange. A resolved response of any status is a
    /// successful fetch; `Err` means the exchange itself failed.
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, FetchResult>;
}
