//! Sync transport between a station and the reconciliation daemon.
//!
//! The [`SyncTransport`] trait is the seam the dispatcher and producer are
//! tested against; [`HttpSyncTransport`] is the production implementation
//! speaking the `POST /checkins:sync` protocol over HTTP.

use async_trait::async_trait;
use thiserror::Error;
use usher_core::checkin::{CheckinEvent, SyncRequest, SyncResponse};
use usher_core::guest::Guest;

/// Errors from a sync submission.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The request never completed (connection refused, DNS, broken pipe).
    #[error("transport fault: {0}")]
    Transport(String),

    /// The request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The server rejected the whole request with 429.
    #[error("rate limited")]
    RateLimited,

    /// The credential was missing or not recognized.
    #[error("unauthorized")]
    Unauthorized,

    /// The server answered with an unexpected status.
    #[error("server error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or status text.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("response parse error: {0}")]
    Parse(String),
}

impl TransportError {
    /// Whether the dispatcher should leave the outbox untouched and retry
    /// the whole request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Unauthorized | Self::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(value.to_string())
        }
    }
}

/// Transport used by the producer (direct submissions) and the dispatcher
/// (batch drains).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Submits a batch of check-in events for reconciliation.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the request as a whole fails;
    /// per-event failures are reported inside the [`SyncResponse`].
    async fn submit_batch(&self, checks: &[CheckinEvent]) -> Result<SyncResponse, TransportError>;

    /// Fetches the shared guest record for an opportunistic cache refresh.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the request fails.
    async fn fetch_guests(&self) -> Result<Vec<Guest>, TransportError>;
}

/// HTTP implementation of [`SyncTransport`].
pub struct HttpSyncTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpSyncTransport {
    /// Creates a transport against `base_url` with the given bearer token.
    ///
    /// The timeout applies per request; a timed-out submission surfaces as
    /// [`TransportError::Timeout`], which the producer degrades to the
    /// offline path.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn read_failure(response: reqwest::Response) -> TransportError {
        let status = response.status();
        match status.as_u16() {
            401 | 403 => TransportError::Unauthorized,
            429 => TransportError::RateLimited,
            code => {
                let message = response.text().await.unwrap_or_default();
                TransportError::Api {
                    status: code,
                    message,
                }
            },
        }
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn submit_batch(&self, checks: &[CheckinEvent]) -> Result<SyncResponse, TransportError> {
        let request = SyncRequest {
            checks: checks.to_vec(),
        };
        let response = self
            .client
            .post(format!("{}/checkins:sync", self.base_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }
        response
            .json::<SyncResponse>()
            .await
            .map_err(|e| TransportError::Parse(e.to_string()))
    }

    async fn fetch_guests(&self) -> Result<Vec<Guest>, TransportError> {
        let response = self
            .client
            .get(format!("{}/guests", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }
        response
            .json::<Vec<Guest>>()
            .await
            .map_err(|e| TransportError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_error_taxonomy() {
        assert!(TransportError::Transport("connection refused".into()).is_retryable());
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::RateLimited.is_retryable());
        assert!(TransportError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());

        assert!(!TransportError::Unauthorized.is_retryable());
        assert!(!TransportError::Api {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportError::Parse("bad json".into()).is_retryable());
    }

    #[test]
    fn base_url_is_normalized() {
        let transport = HttpSyncTransport::new(
            "http://localhost:8460/",
            "token",
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(transport.base_url, "http://localhost:8460");
    }
}
