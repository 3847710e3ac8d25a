use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub max_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Failures the next overlapping window is expected to recover from.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            FetchError::HttpStatus { status, .. } => {
                StatusCode::from_u16(*status)
                    .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                    .unwrap_or(false)
            }
        }
    }
}

/// Thin JSON GET client for the ledger API. Single attempt per call; the
/// window overlap is what retries a failed fetch.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("ledger token is not a valid header value")?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        })
    }

    pub async fn get_bytes(
        &self,
        run_id: Uuid,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<u8>, FetchError> {
        // the semaphore is never closed
        let _permit = self.limit.acquire().await.ok();

        let span = info_span!("ledger_get", %run_id, url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "ledger page received");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        let throttled = FetchError::HttpStatus {
            status: 429,
            url: "https://ledger.test/receipts".into(),
        };
        let unavailable = FetchError::HttpStatus {
            status: 503,
            url: "https://ledger.test/receipts".into(),
        };
        let forbidden = FetchError::HttpStatus {
            status: 403,
            url: "https://ledger.test/receipts".into(),
        };
        assert!(throttled.is_transient());
        assert!(unavailable.is_transient());
        assert!(!forbidden.is_transient());
    }

    #[test]
    fn invalid_token_is_rejected_at_build_time() {
        let config = HttpClientConfig {
            bearer_token: Some("bad\ntoken".into()),
            ..Default::default()
        };
        assert!(HttpFetcher::new(config).is_err());
    }
}
