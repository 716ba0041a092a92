//! HTTP access for manifests and runtime artifacts.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::Client;
use tokio::io::AsyncWriteExt as _;

use crate::error::{AppError, Result};

const USER_AGENT: &str = concat!("campp-launcher/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress callback: `(bytes_so_far, total_bytes_if_known)`.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(u64, Option<u64>) + Send);

/// Source of manifests and artifacts. Tests substitute an in-memory fetcher.
pub trait RuntimeFetcher: Send + Sync {
    /// Fetch a small text document (the manifest).
    fn fetch_text(&self, url: &str) -> impl Future<Output = Result<String>> + Send;

    /// Stream `url` into `dest`, returning the number of bytes written.
    fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> impl Future<Output = Result<u64>> + Send;
}

/// `reqwest`-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(HTTP_TIMEOUT)
            .read_timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AppError::network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn get_ok(&self, url: &str) -> Result<reqwest::Response> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::network_with_url(url, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AppError::network_with_url(url, resp.status().to_string()));
        }
        Ok(resp)
    }
}

impl RuntimeFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let resp = self.get_ok(url).await?;
        resp.text()
            .await
            .map_err(|e| AppError::network_with_url(url, e.to_string()))
    }

    async fn download(&self, url: &str, dest: &Path, progress: ProgressFn<'_>) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let resp = self.get_ok(url).await?;
        let total = resp.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        progress(0, total);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AppError::network_with_url(url, e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(written, total);
        }
        file.flush().await?;

        Ok(written)
    }
}

/// Bounded retries with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempts are used up, returning the last error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < attempts => {
                    let delay = self.delay_after(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Prefix a URL with the download proxy. An empty proxy leaves it unchanged.
pub fn with_proxy(proxy: &str, url: &str) -> String {
    let proxy = proxy.trim();
    if proxy.is_empty() {
        url.to_string()
    } else {
        format!("{}/{}", proxy.trim_end_matches('/'), url)
    }
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    use sha2::{Digest as _, Sha256};
    use std::io::Read as _;

    let mut file = std::fs::File::open(path)
        .map_err(|e| AppError::io(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(0), Duration::from_millis(500));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retry_stops_after_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let value = policy
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::network("first"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let err = policy
            .run("always", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::network("down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn proxy_prefixes_url() {
        assert_eq!(with_proxy("", "https://a/b.zip"), "https://a/b.zip");
        assert_eq!(
            with_proxy("https://mirror.example/", "https://a/b.zip"),
            "https://mirror.example/https://a/b.zip"
        );
    }

    #[test]
    fn sha256_of_known_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
