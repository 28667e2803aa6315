//! Remote source retrieval for the update pipeline.

use crate::error::{WardenError, WardenResult};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seam between the update controller and the network.
///
/// Production code uses [`HttpFetcher`]; tests substitute canned sources.
pub trait SourceFetcher: Send + Sync {
    /// Fetch the latest candidate source as opaque text.
    fn fetch(&self) -> WardenResult<String>;
}

/// Blocking HTTP fetcher with a cache-busting query parameter so
/// intermediate caches cannot serve stale bytes.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    url: String,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    fn busted_url(&self) -> String {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}t={}", self.url, separator, stamp)
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch(&self) -> WardenResult<String> {
        if self.url.trim().is_empty() {
            return Err(WardenError::Fetch(
                "update.source_url is not configured".into(),
            ));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| WardenError::Fetch(err.to_string()))?;

        let response = client
            .get(self.busted_url())
            .send()
            .map_err(|err| WardenError::Fetch(err.to_string()))?;

        if !response.status().is_success() {
            return Err(WardenError::Fetch(format!(
                "remote returned HTTP {}",
                response.status()
            )));
        }

        response
            .text()
            .map_err(|err| WardenError::Fetch(err.to_string()))
    }
}
