//! reqwest-backed implementation of the network seam.

use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::{Fetch, FetchError, FetchResult, Request, Response};

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout. The caching core imposes no bound of its own,
    /// so this is what keeps a hung request from blocking its task forever.
    pub timeout: Duration,
    /// Maximum redirects to follow.
    pub max_redirects: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "Offkit/0.1".to_string(),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Real network transport on top of reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher with default configuration.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_config(FetcherConfig::default())
    }

    /// Create a fetcher with custom configuration.
    pub fn with_config(config: FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    fn classify_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::HttpError(err)
        }
    }

    async fn execute(&self, request: &Request) -> FetchResult {
        debug!(method = %request.method, url = %request.url, "fetching");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| self.classify_error(e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        // The client timeout covers the body read as well.
        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify_error(e))?;

        trace!(url = %url, status = %status, body_len = body.len(), "response received");

        Ok(Response {
            url,
            status,
            headers,
            body,
        })
    }
}

impl Fetch for HttpFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, FetchResult> {
        Box::pin(self.execute(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_fetcher_config_default() {
        let config = FetcherConfig::default();
        assert_eq!(config.user_agent, "Offkit/0.1");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_fetch_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/recipes"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("[]", "application/json"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = Url::parse(&format!("{}/recipes", server.uri())).unwrap();
        let response = fetcher.fetch(&Request::get(url)).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.text().unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_fetch_resolves_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let response = fetcher.fetch(&Request::get(url)).await.unwrap();

        // A 404 is a completed exchange, not a network failure.
        assert!(!response.ok());
        assert_eq!(response.status.as_u16(), 404);
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_error() {
        // Nothing listens on this port.
        let fetcher = HttpFetcher::new().unwrap();
        let url = Url::parse("http://127.0.0.1:1/unreachable").unwrap();
        let result = fetcher.fetch(&Request::get(url)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::with_config(FetcherConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();

        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let result = fetcher.fetch(&Request::get(url)).await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }
}
