//! Outbound fetch transport used by the script loader.
//!
//! One [`HttpTransport`] is shared by every render: it owns the keep-alive
//! connection pool and the optional URL-keyed response cache, and carries no
//! per-render state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use reqwest::Client;

use crate::abort::{AbortableFetch, FetchError};

/// Fetch-by-URL capability consumed by resource loaders.
pub trait Transport: Send + Sync {
    fn fetch(&self, url: &str) -> AbortableFetch<Bytes>;
}

/// Settings for the outbound HTTP transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// Extra attempts after a failed request (network errors and 5xx only)
    pub retries: u32,
    /// Base delay between attempts, multiplied by the attempt number
    pub retry_delay: Duration,
    /// Keep successful responses in memory, keyed by URL
    pub cache: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 2,
            retry_delay: Duration::from_millis(100),
            cache: true,
        }
    }
}

type ResponseCache = Arc<Mutex<HashMap<String, Bytes>>>;

pub struct HttpTransport {
    client: Client,
    config: TransportConfig,
    cache: Option<ResponseCache>,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, anyhow::Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        let cache = config.cache.then(ResponseCache::default);

        Ok(Self {
            client,
            config,
            cache,
        })
    }

    fn cached(&self, url: &str) -> Option<Bytes> {
        let cache = self.cache.as_ref()?;
        let entries = cache.lock().ok()?;
        entries.get(url).cloned()
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str) -> AbortableFetch<Bytes> {
        if let Some(bytes) = self.cached(url) {
            tracing::trace!(url, "transport cache hit");
            return AbortableFetch::ready(bytes);
        }

        let client = self.client.clone();
        let config = self.config.clone();
        let cache = self.cache.clone();
        let url = url.to_string();

        AbortableFetch::new(async move {
            let bytes = fetch_with_retry(&client, &url, &config).await?;
            if let Some(cache) = cache {
                if let Ok(mut entries) = cache.lock() {
                    entries.insert(url, bytes.clone());
                }
            }
            Ok(bytes)
        })
    }
}

async fn fetch_with_retry(
    client: &Client,
    url: &str,
    config: &TransportConfig,
) -> Result<Bytes, FetchError> {
    let mut attempt = 0;
    loop {
        match fetch_once(client, url).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) if attempt < config.retries && is_retryable(&err) => {
                attempt += 1;
                tracing::debug!(url, attempt, error = %err, "retrying fetch");
                tokio::time::sleep(config.retry_delay * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn fetch_once(client: &Client, url: &str) -> Result<Bytes, FetchError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    response.bytes().await.map_err(|e| FetchError::Transport {
        url: url.to_string(),
        reason: format!("Failed to read response body: {}", e),
    })
}

fn is_retryable(err: &FetchError) -> bool {
    match err {
        FetchError::Transport { .. } => true,
        FetchError::Status { status, .. } => *status >= 500,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fast_config(cache: bool) -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_secs(5),
            retries: 2,
            retry_delay: Duration::from_millis(1),
            cache,
        }
    }

    #[tokio::test]
    async fn test_fetches_body() {
        let base = serve(Router::new().route("/a.js", get(|| async { "window.A = 1;" }))).await;
        let transport = HttpTransport::new(fast_config(false)).unwrap();
        let bytes = transport.fetch(&format!("{}/a.js", base)).await.unwrap();
        assert_eq!(&bytes[..], b"window.A = 1;");
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new().route(
            "/flaky.js",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::SERVICE_UNAVAILABLE, "later")
                    } else {
                        (StatusCode::OK, "ok")
                    }
                }
            }),
        );
        let base = serve(router).await;
        let transport = HttpTransport::new(fast_config(false)).unwrap();

        let bytes = transport.fetch(&format!("{}/flaky.js", base)).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new().route(
            "/missing.js",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::NOT_FOUND, "nope") }
            }),
        );
        let base = serve(router).await;
        let transport = HttpTransport::new(fast_config(false)).unwrap();

        let err = transport
            .fetch(&format!("{}/missing.js", base))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_requests() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new().route(
            "/bundle.js",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { "bundle" }
            }),
        );
        let base = serve(router).await;
        let transport = HttpTransport::new(fast_config(true)).unwrap();
        let url = format!("{}/bundle.js", base);

        transport.fetch(&url).await.unwrap();
        let second = transport.fetch(&url).await.unwrap();
        assert_eq!(&second[..], b"bundle");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
