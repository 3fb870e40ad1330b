use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use reqwest::{Client, ClientBuilder, Proxy};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use crate::errors::{AppError, Result};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Shared HTTP clients for API calls, RPC calls and host downloads.
///
/// Requests through [`HttpPool::get_client`] must finish within the timeout. Downloads
/// have no overall deadline; they only fail when no data arrives for that long.
pub struct HttpPool {
    client: Client,
    download_client: Client,
    max_connections: usize,
    timeout: Duration,
}

impl HttpPool {
    pub fn new(max_connections: usize, timeout_seconds: u64) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_seconds);
        let client = Self::builder(max_connections).timeout(timeout).build()?;
        let download_client = Self::builder(max_connections).build()?;

        Ok(Self {
            client,
            download_client,
            max_connections,
            timeout,
        })
    }

    pub fn with_proxy(mut self, proxy_url: &str) -> Result<Self> {
        let proxy = Proxy::all(proxy_url)?;
        self.client = Self::builder(self.max_connections)
            .timeout(self.timeout)
            .proxy(proxy.clone())
            .build()?;
        self.download_client = Self::builder(self.max_connections).proxy(proxy).build()?;
        Ok(self)
    }

    fn builder(max_connections: usize) -> ClientBuilder {
        ClientBuilder::new()
            .pool_max_idle_per_host(max_connections)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Streams `url` into `destination`, retrying the whole transfer a few times
    pub async fn download_to_file<F>(
        &self,
        url: &str,
        destination: &Path,
        headers: &[(String, String)],
        mut progress_callback: F,
    ) -> Result<u64>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        const MAX_RETRIES: u32 = 3;
        const RETRY_DELAY: Duration = Duration::from_secs(2);

        for attempt in 1..=MAX_RETRIES {
            log::info!("🌐 [HTTP] Attempt {} of {} for URL: {}", attempt, MAX_RETRIES, url);

            match self
                .try_download(url, destination, headers, &mut progress_callback)
                .await
            {
                Ok(written) => {
                    log::info!("✅ [HTTP] Download successful on attempt {}", attempt);
                    return Ok(written);
                }
                // Client errors will not improve on retry.
                Err(AppError::Http(e)) if e.status().map_or(false, |s| s.is_client_error()) => {
                    log::error!("❌ [HTTP] Server refused the download: {}", e);
                    return Err(AppError::Http(e));
                }
                Err(e) => {
                    log::warn!("⚠️ [HTTP] Attempt {} failed: {}", attempt, e);

                    if attempt < MAX_RETRIES {
                        log::info!("🔄 [HTTP] Retrying in {:?}...", RETRY_DELAY);
                        tokio::time::sleep(RETRY_DELAY).await;
                    } else {
                        log::error!("❌ [HTTP] All {} attempts failed", MAX_RETRIES);
                        return Err(e);
                    }
                }
            }
        }

        Err(AppError::Validation("download attempted zero times".to_string()))
    }

    async fn try_download<F>(
        &self,
        url: &str,
        destination: &Path,
        headers: &[(String, String)],
        progress_callback: &mut F,
    ) -> Result<u64>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let mut request = self.download_client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = self
            .idle_guard(request.send())
            .await??
            .error_for_status()?;

        let total_size = response.content_length().unwrap_or(0);
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(destination).await?;

        use futures_util::StreamExt;
        while let Some(chunk) = self.idle_guard(stream.next()).await? {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress_callback(DownloadProgress::new(downloaded, total_size));
        }

        file.flush().await?;
        Ok(downloaded)
    }

    /// Fails when `step` makes no progress within the pool timeout
    async fn idle_guard<T>(&self, step: impl std::future::Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.timeout, step).await.map_err(|_| {
            AppError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no data received for {:?}", self.timeout),
            ))
        })
    }
}

/// Owner of the process-wide pool
pub struct HttpPoolManager {
    pool: Arc<HttpPool>,
}

impl HttpPoolManager {
    pub fn new(max_connections: usize, timeout_seconds: u64) -> Result<Self> {
        let pool = HttpPool::new(max_connections, timeout_seconds)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn with_proxy(mut self, proxy_url: &str) -> Result<Self> {
        let pool = HttpPool::new(self.pool.max_connections, self.pool.timeout.as_secs())?
            .with_proxy(proxy_url)?;
        self.pool = Arc::new(pool);
        Ok(self)
    }

    pub fn get_pool(&self) -> Arc<HttpPool> {
        self.pool.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub progress_percentage: f32,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: u64) -> Self {
        let progress = if total > 0 {
            (downloaded as f32 / total as f32) * 100.0
        } else {
            0.0
        };

        Self {
            downloaded_bytes: downloaded,
            total_bytes: total,
            progress_percentage: progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_handles_unknown_length() {
        assert_eq!(DownloadProgress::new(10, 0).progress_percentage, 0.0);
        assert_eq!(DownloadProgress::new(50, 200).progress_percentage, 25.0);
    }

    /// Serves one response that sends `body_len` bytes `gap` apart, then waits
    /// `stall` before closing
    async fn trickle_server(body_len: usize, declared_len: usize, gap: Duration, stall: Duration) -> String {
        use tokio::io::AsyncReadExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                declared_len
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            for _ in 0..body_len {
                if socket.write_all(b"x").await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                tokio::time::sleep(gap).await;
            }
            tokio::time::sleep(stall).await;
        });
        format!("http://{}/video.mp4", address)
    }

    #[tokio::test]
    async fn slow_but_steady_transfer_outlives_the_request_timeout() {
        let url = trickle_server(30, 30, Duration::from_millis(100), Duration::ZERO).await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("video.mp4");
        let pool = HttpPool::new(2, 1).unwrap();

        let written = pool
            .download_to_file(&url, &destination, &[], |_| {})
            .await
            .unwrap();

        assert_eq!(written, 30);
        assert_eq!(std::fs::read(&destination).unwrap().len(), 30);
    }

    #[tokio::test]
    async fn stalled_transfer_times_out() {
        let url = trickle_server(5, 30, Duration::from_millis(10), Duration::from_secs(5)).await;
        let dir = tempfile::tempdir().unwrap();
        let pool = HttpPool::new(2, 1).unwrap();

        let result = pool
            .try_download(&url, &dir.path().join("video.mp4"), &[], &mut |_| {})
            .await;

        match result {
            Err(AppError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("expected an idle timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn pool_keeps_its_timeout() {
        let manager = HttpPoolManager::new(4, 12).unwrap();
        assert_eq!(manager.get_pool().timeout(), Duration::from_secs(12));
    }
}
