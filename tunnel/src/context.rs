use http::HeaderValue;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Correlation id of one tunnel request.
///
/// Sent back to the caller and to the upstream in `X-Sentry-Tunnel-Id` and
/// attached to every log line of the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TunnelId(Uuid);

impl TunnelId {
    pub fn new() -> Self {
        TunnelId(Uuid::new_v4())
    }

    pub fn header_value(&self) -> HeaderValue {
        // A hyphenated UUID is always a valid header value
        HeaderValue::from_str(&self.to_string()).unwrap_or(HeaderValue::from_static("unknown"))
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Request-scoped values, built once per inbound request and handed to each
/// stage explicitly.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub tunnel_id: TunnelId,
    pub received_at: Instant,
    /// Point in time by which a response must be produced.
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(timeout: Duration) -> Self {
        let received_at = Instant::now();
        RequestContext {
            tunnel_id: TunnelId::new(),
            received_at,
            deadline: received_at + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
