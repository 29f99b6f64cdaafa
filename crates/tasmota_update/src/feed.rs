//! Latest published firmware release, read from the GitHub release feed.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use tracing::error;

use crate::config::FeedConfig;

/// Why the latest release could not be determined
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("invalid release payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("release tag is empty")]
    EmptyTag,
}

/// Strip the leading `v` from a release tag
pub fn normalize_version(tag: &str) -> &str {
    tag.trim_start_matches('v')
}

/// Source of the latest published firmware version
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Latest release version, normalized
    async fn try_fetch_latest_version(&self) -> Result<String, FeedError>;

    /// Latest release version, or None if it could not be fetched
    ///
    /// Failures are logged here and not reported further.
    async fn fetch_latest_version(&self) -> Option<String> {
        match self.try_fetch_latest_version().await {
            Ok(version) => Some(version),
            Err(e) => {
                error!("Error fetching the latest firmware: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// HTTP client for a GitHub `releases/latest` endpoint
#[derive(Debug, Clone)]
pub struct ReleaseFeedClient {
    client: reqwest::Client,
    url: String,
}

impl ReleaseFeedClient {
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReleaseFeed for ReleaseFeedClient {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn try_fetch_latest_version(&self) -> Result<String, FeedError> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let release: Release = serde_json::from_slice(&body)?;
        debug!("Latest release tag: {}", release.tag_name);

        let version = normalize_version(&release.tag_name);
        if version.is_empty() {
            return Err(FeedError::EmptyTag);
        }
        Ok(version.to_string())
    }
}

/// Feed with a fixed answer, for tests
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct StaticReleaseFeed {
    /// Tag to serve, or the HTTP status to fail with
    pub result: Result<String, u16>,
}

#[cfg(test)]
impl StaticReleaseFeed {
    pub fn tag(tag: &str) -> Self {
        Self {
            result: Ok(tag.to_string()),
        }
    }

    pub fn failing(status: u16) -> Self {
        Self { result: Err(status) }
    }
}

#[cfg(test)]
#[async_trait]
impl ReleaseFeed for StaticReleaseFeed {
    async fn try_fetch_latest_version(&self) -> Result<String, FeedError> {
        match &self.result {
            Ok(tag) => Ok(normalize_version(tag).to_string()),
            Err(status) => Err(FeedError::Status(*status)),
        }
    }
}
