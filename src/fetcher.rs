//! Retrieval of subscription payloads.

use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::middleware::{is_transient, RetryTransientMiddleware};
use crate::model::Source;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use log::{debug, info};
use reqwest::header::{ACCEPT, CACHE_CONTROL, USER_AGENT};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use std::num::NonZeroU32;
use std::sync::Arc;
use url::Url;

/// Retrieves the raw subscription payload of a source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError>;
}

type FetchLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Fetches subscriptions over HTTP(S), or from disk for `file://` URLs.
#[derive(Clone)]
pub struct HttpFetcher {
    client: ClientWithMiddleware,
    limiter: Arc<FetchLimiter>,
    user_agent: String,
}

impl HttpFetcher {
    /// Create a fetcher with the timeout, retry and pacing settings of `config`.
    pub fn new(config: &EngineConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .connect_timeout(config.fetch_timeout)
            .build()?;
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new(
                config.fetch_retries,
                config.retry_backoff,
            ))
            .build();

        let rps = NonZeroU32::new(config.fetch_rate_per_second.ceil().max(1.0) as u32)
            .unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            limiter,
            user_agent: config.user_agent.clone(),
        })
    }

    /// Fetch a URL that is not (yet) registered as a source.
    pub async fn fetch_url(&self, raw_url: &str) -> Result<Vec<u8>, FetchError> {
        let url = Url::parse(raw_url.trim())
            .map_err(|e| FetchError::permanent(raw_url, format!("malformed URL: {}", e)))?;

        match url.scheme() {
            "http" | "https" => self.fetch_http(url).await,
            "file" => fetch_file(&url).await,
            other => Err(FetchError::permanent(
                raw_url,
                format!("unsupported scheme {:?}", other),
            )),
        }
    }

    async fn fetch_http(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        self.limiter.until_ready().await;
        debug!("Fetching subscription {}", url);

        let response = self
            .client
            .get(url.clone())
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "text/plain, application/octet-stream, */*")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| classify_middleware_error(url.as_str(), e))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FetchError::permanent(url.as_str(), format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::transient(url.as_str(), format!("HTTP {}", status)));
        }

        let body = response.bytes().await.map_err(|e| {
            if is_transient(&e) {
                FetchError::transient(url.as_str(), e.to_string())
            } else {
                FetchError::permanent(url.as_str(), e.to_string())
            }
        })?;
        info!("Fetched {} bytes from {}", body.len(), url);
        Ok(body.to_vec())
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError> {
        self.fetch_url(&source.url).await
    }
}

fn classify_middleware_error(url: &str, err: reqwest_middleware::Error) -> FetchError {
    match err {
        reqwest_middleware::Error::Reqwest(e) if is_transient(&e) => {
            FetchError::transient(url, e.to_string())
        }
        reqwest_middleware::Error::Reqwest(e) => FetchError::permanent(url, e.to_string()),
        other => FetchError::transient(url, other.to_string()),
    }
}

async fn fetch_file(url: &Url) -> Result<Vec<u8>, FetchError> {
    let path = url
        .to_file_path()
        .map_err(|_| FetchError::permanent(url.as_str(), "not a local file path"))?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(FetchError::permanent(url.as_str(), e.to_string()))
        }
        Err(e) => Err(FetchError::transient(url.as_str(), e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchErrorKind;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve canned HTTP responses in order, one per connection.
    async fn serve(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}/sub", addr), hits)
    }

    fn fetcher() -> HttpFetcher {
        let config = EngineConfig::builder()
            .fetch_timeout(Duration::from_secs(2))
            .fetch_retries(2)
            .retry_backoff(Duration::from_millis(10))
            .fetch_rate_per_second(100.0)
            .build();
        HttpFetcher::new(&config).unwrap()
    }

    #[tokio::test]
    async fn not_found_is_permanent_and_not_retried() {
        let (url, hits) = serve(vec![
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ])
        .await;
        let err = fetcher().fetch_url(&url).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Permanent);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let (url, hits) = serve(vec![
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            "HTTP/1.1 200 OK\r\nContent-Length: 17\r\nConnection: close\r\n\r\nvless://u@h:443\r\n",
        ])
        .await;
        let body = fetcher().fetch_url(&url).await.unwrap();
        assert_eq!(body, b"vless://u@h:443\r\n");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_and_unsupported_urls_are_permanent() {
        let f = fetcher();
        let err = f.fetch_url("not a url").await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Permanent);
        let err = f.fetch_url("ftp://example.com/sub").await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Permanent);
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = fetcher()
            .fetch_url(&format!("http://127.0.0.1:{}/sub", port))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn file_urls_are_read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "trojan://pw@1.2.3.4:443#t").unwrap();
        let url = Url::from_file_path(file.path()).unwrap();

        let f = fetcher();
        let body = f.fetch_url(url.as_str()).await.unwrap();
        assert_eq!(body, b"trojan://pw@1.2.3.4:443#t\n");

        let missing = Url::from_file_path(file.path().with_extension("missing")).unwrap();
        let err = f.fetch_url(missing.as_str()).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Permanent);
    }
}
