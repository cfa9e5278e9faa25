use crate::config::RetryConfig;
use crate::context::TunnelId;
use crate::destination::Destination;
use crate::metrics_defs::{FORWARD_ATTEMPTS, FORWARD_ERROR, FORWARD_SUCCESS};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};

pub const USER_AGENT: &str = concat!("sentrytunnel/", env!("CARGO_PKG_VERSION"));
pub const TUNNEL_ID_HEADER: &str = "x-sentry-tunnel-id";
pub const SENTRY_AUTH_HEADER: &str = "x-sentry-auth";
pub const ENVELOPE_CONTENT_TYPE: &str = "application/x-sentry-envelope";

#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
    #[error("upstream unavailable after {attempts} attempts: {reason}")]
    UpstreamUnavailable { attempts: u32, reason: String },
    #[error("deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32 },
}

impl ForwardError {
    pub fn attempts(&self) -> u32 {
        match self {
            ForwardError::UpstreamUnavailable { attempts, .. } => *attempts,
            ForwardError::DeadlineExceeded { attempts } => *attempts,
        }
    }
}

/// The upstream's answer, relayed to the caller as is.
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
    /// Number of attempts it took to get this response.
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// 429 and 5xx are worth another attempt. Everything else is the upstream's
/// final word and gets relayed.
fn is_retriable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Sends envelopes to their upstream ingestion endpoint.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    send_auth_header: bool,
}

impl Forwarder {
    pub fn new(retry: RetryPolicy, attempt_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            // a redirect is an answer for the caller, not a hop for the tunnel
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Forwarder {
            client,
            retry,
            attempt_timeout,
            send_auth_header: false,
        })
    }

    /// Send the DSN key as `X-Sentry-Auth`, for envelopes whose header no
    /// longer carries it.
    pub fn with_auth_header(mut self, enabled: bool) -> Self {
        self.send_auth_header = enabled;
        self
    }

    /// Posts `envelope` to the destination's ingestion endpoint.
    ///
    /// Transport failures, per-attempt timeouts and retriable statuses are
    /// retried with capped exponential backoff until the policy runs out of
    /// attempts or the next attempt would not start before `deadline`.
    /// Records exactly one of `forward.success` / `forward.error`.
    pub async fn send(
        &self,
        destination: &Destination,
        envelope: Bytes,
        tunnel_id: &TunnelId,
        deadline: Instant,
    ) -> Result<UpstreamResponse, ForwardError> {
        let result = self
            .send_with_retries(destination, envelope, tunnel_id, deadline)
            .await;

        let attempts = match &result {
            Ok(response) => response.attempts,
            Err(e) => e.attempts(),
        };
        shared::histogram!(FORWARD_ATTEMPTS).record(attempts as f64);

        match &result {
            Ok(response) if response.status.is_success() => {
                shared::counter!(FORWARD_SUCCESS).increment(1)
            }
            _ => shared::counter!(FORWARD_ERROR).increment(1),
        }

        result
    }

    async fn send_with_retries(
        &self,
        destination: &Destination,
        envelope: Bytes,
        tunnel_id: &TunnelId,
        deadline: Instant,
    ) -> Result<UpstreamResponse, ForwardError> {
        let auth = match self.send_auth_header {
            true => destination.auth_header(USER_AGENT),
            false => None,
        };
        let mut attempts = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ForwardError::DeadlineExceeded { attempts });
            }
            attempts += 1;

            let budget = remaining.min(self.attempt_timeout);
            let attempt = self.attempt(destination, envelope.clone(), tunnel_id, auth.as_deref());

            let failure = match timeout(budget, attempt).await {
                Ok(Ok(response)) if is_retriable(response.status) => {
                    format!("upstream returned {}", response.status)
                }
                Ok(Ok(mut response)) => {
                    response.attempts = attempts;
                    return Ok(response);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) if budget == remaining => {
                    return Err(ForwardError::DeadlineExceeded { attempts });
                }
                Err(_) => format!("attempt timed out after {budget:?}"),
            };

            tracing::warn!(
                tunnel_id = %tunnel_id,
                destination = %destination,
                attempt = attempts,
                error = %failure,
                "upstream attempt failed"
            );

            if attempts >= self.retry.max_attempts {
                return Err(ForwardError::UpstreamUnavailable {
                    attempts,
                    reason: failure,
                });
            }

            let delay = self.retry.backoff(attempts);
            if Instant::now() + delay >= deadline {
                return Err(ForwardError::DeadlineExceeded { attempts });
            }
            sleep(delay).await;
        }
    }

    async fn attempt(
        &self,
        destination: &Destination,
        envelope: Bytes,
        tunnel_id: &TunnelId,
        auth: Option<&str>,
    ) -> Result<UpstreamResponse, reqwest::Error> {
        let mut request = self
            .client
            .post(destination.upstream_url().clone())
            .header(CONTENT_TYPE, ENVELOPE_CONTENT_TYPE)
            .header(TUNNEL_ID_HEADER, tunnel_id.header_value())
            .body(envelope);

        if let Some(auth) = auth {
            request = request.header(SENTRY_AUTH_HEADER, auth);
        }

        let response = request.send().await?;
        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
            attempts: 0,
        })
    }
}
