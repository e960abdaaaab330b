use crate::config::SourceConfig;
use crate::constants::MAX_ERROR_BODY_BYTES;
use crate::error::{Result, WatchError};
use crate::metrics::SourcesMetrics;
use crate::types::FetchedContent;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Retrieves the raw payload of one publisher. Implementations never retry.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, source: &SourceConfig) -> Result<FetchedContent>;
}

/// HTTP GET fetcher with a bounded per-request timeout
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("sanctions_watch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WatchError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    #[instrument(skip(self, source), fields(source = %source.id, url = %source.url))]
    async fn fetch(&self, source: &SourceConfig) -> Result<FetchedContent> {
        let started = Instant::now();
        let result = self.fetch_inner(source).await;
        match &result {
            Ok(content) => {
                let elapsed = started.elapsed().as_secs_f64();
                debug!(bytes = content.bytes.len(), elapsed_secs = elapsed, "fetched payload");
                SourcesMetrics::record_fetch_success(&source.id, elapsed, content.bytes.len());
            }
            Err(e) => {
                warn!(error = %e, "fetch failed");
                SourcesMetrics::record_fetch_error(&source.id, e.kind());
            }
        }
        result
    }
}

impl ReqwestFetcher {
    async fn fetch_inner(&self, source: &SourceConfig) -> Result<FetchedContent> {
        let resp = self
            .client
            .get(&source.url)
            .send()
            .await
            .map_err(|e| WatchError::Transport {
                url: source.url.clone(),
                source: e,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WatchError::Status {
                url: source.url.clone(),
                status: status.as_u16(),
                body: crate::constants::truncate_utf8(&body, MAX_ERROR_BODY_BYTES).to_string(),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| WatchError::Body {
            url: source.url.clone(),
            source: e,
        })?;

        Ok(FetchedContent {
            bytes: bytes.to_vec(),
            kind: source.parser.content_kind(),
        })
    }
}
