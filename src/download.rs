//! Artifact download with retries.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{RepoError, RepoResult};

/// Fetches artifact bytes to a destination path.
#[async_trait]
pub trait ArtifactDownloader: Send + Sync {
    /// Download `url` to `dest`, retrying transient failures. Raises
    /// [`RepoError::Download`] once the retries are exhausted.
    async fn download(&self, url: &str, dest: &Path) -> RepoResult<()>;
}

/// [`ArtifactDownloader`] over plain HTTP(S) with a fixed retry budget.
pub struct HttpDownloader {
    client: reqwest::Client,
    attempts: usize,
    backoff: Duration,
}

impl HttpDownloader {
    /// Create a downloader with the default retry budget.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }

    async fn try_download(&self, url: &str, dest: &Path) -> RepoResult<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RepoError::Download(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RepoError::Download(e.to_string()))?;
        tokio::fs::write(dest, &body).await?;
        Ok(())
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactDownloader for HttpDownloader {
    async fn download(&self, url: &str, dest: &Path) -> RepoResult<()> {
        info!("Downloading {} to {}", url, dest.display());
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.try_download(url, dest).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Attempt {}/{} failed: {}", attempt, self.attempts, e);
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        Err(RepoError::Download(format!(
            "{} after {} attempts: {}",
            url,
            self.attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}
