//! The tunnel request pipeline.
//!
//! Every request walks the same stages, strictly in order:
//!
//! ```text
//! Received -> Parsed -> Resolved -> Validated -> Forwarded -> Completed
//! ```
//!
//! The first failing stage ends the request. Parsing, resolution and the trust
//! check are pure; forwarding is the only stage that waits on I/O.

use crate::context::RequestContext;
use crate::destination::{Destination, ResolveError};
use crate::envelope::{Envelope, ParseError};
use crate::forwarder::{ForwardError, Forwarder, UpstreamResponse};
use crate::metrics_defs::{ENVELOPE_ACCEPTED, ENVELOPE_REJECTED};
use crate::trust::{TrustList, TrustRejected};
use bytes::Bytes;
use http::StatusCode;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Resolve,
    Trust,
    Forward,
}

impl Stage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Resolve => "resolve",
            Stage::Trust => "trust",
            Stage::Forward => "forward",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request that ended before completing.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Trust(#[from] TrustRejected),
    #[error("failed to re-encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Parse(_) => Stage::Parse,
            PipelineError::Resolve(_) => Stage::Resolve,
            PipelineError::Trust(_) | PipelineError::Encode(_) => Stage::Trust,
            PipelineError::Forward(_) => Stage::Forward,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::Parse(_) | PipelineError::Resolve(_) => StatusCode::BAD_REQUEST,
            PipelineError::Trust(_) => StatusCode::FORBIDDEN,
            PipelineError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::Forward(ForwardError::UpstreamUnavailable { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            PipelineError::Forward(ForwardError::DeadlineExceeded { .. }) => {
                StatusCode::GATEWAY_TIMEOUT
            }
        }
    }

    /// Message for the caller. Never contains keys, the trust list or
    /// upstream transport details.
    pub fn client_message(&self) -> String {
        match self {
            PipelineError::Parse(e) => e.to_string(),
            PipelineError::Resolve(e) => e.to_string(),
            PipelineError::Trust(e) => e.to_string(),
            PipelineError::Encode(_) => "internal error".into(),
            PipelineError::Forward(ForwardError::UpstreamUnavailable { .. }) => {
                "upstream unavailable".into()
            }
            PipelineError::Forward(ForwardError::DeadlineExceeded { .. }) => {
                "request timed out".into()
            }
        }
    }
}

pub struct Pipeline {
    trust_list: Arc<TrustList>,
    forwarder: Forwarder,
    strip_dsn_credentials: bool,
}

impl Pipeline {
    pub fn new(trust_list: Arc<TrustList>, forwarder: Forwarder) -> Self {
        Pipeline {
            trust_list,
            forwarder,
            strip_dsn_credentials: false,
        }
    }

    /// Replace the header DSN with its key-less form before forwarding. The
    /// forwarder must then carry the key in `X-Sentry-Auth`.
    pub fn with_credential_stripping(mut self, enabled: bool) -> Self {
        self.strip_dsn_credentials = enabled;
        self.forwarder = self.forwarder.with_auth_header(enabled);
        self
    }

    pub async fn process(
        &self,
        ctx: &RequestContext,
        raw: Bytes,
    ) -> Result<UpstreamResponse, PipelineError> {
        let size = raw.len();

        let (destination, payload) = match self.admit(raw) {
            Ok(admitted) => admitted,
            Err(e) => {
                shared::counter!(ENVELOPE_REJECTED).increment(1);
                return Err(e);
            }
        };
        shared::counter!(ENVELOPE_ACCEPTED).increment(1);

        tracing::info!(
            tunnel_id = %ctx.tunnel_id,
            destination = %destination,
            size,
            budget_ms = ctx.remaining().as_millis() as u64,
            "forwarding envelope"
        );

        let response = self
            .forwarder
            .send(&destination, payload, &ctx.tunnel_id, ctx.deadline)
            .await?;

        tracing::debug!(
            tunnel_id = %ctx.tunnel_id,
            destination = %destination,
            status = %response.status,
            attempts = response.attempts,
            "upstream responded"
        );

        Ok(response)
    }

    /// Runs the pure stages and returns the destination together with the
    /// bytes to send to it.
    fn admit(&self, raw: Bytes) -> Result<(Destination, Bytes), PipelineError> {
        let mut envelope = Envelope::parse(raw.clone())?;
        let destination = Destination::resolve(envelope.header())?;
        self.trust_list.check(&destination)?;

        if self.strip_dsn_credentials && destination.credential().is_some() {
            envelope.header_mut().dsn = Some(destination.sanitized_dsn());
            return Ok((destination, envelope.serialize()?));
        }

        Ok((destination, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::{RetryPolicy, SENTRY_AUTH_HEADER};
    use crate::metrics_defs::{FORWARD_ERROR, FORWARD_SUCCESS};
    use crate::testutils::{Counters, MockUpstream, unreachable_port};
    use metrics_util::debugging::DebuggingRecorder;
    use std::time::Duration;

    fn pipeline(trusted: &[String]) -> Pipeline {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let forwarder = Forwarder::new(retry, Duration::from_secs(5)).unwrap();
        Pipeline::new(Arc::new(TrustList::from_entries(trusted).unwrap()), forwarder)
    }

    fn envelope(dsn: &str) -> Bytes {
        Bytes::from(format!(
            "{{\"dsn\":\"{dsn}\"}}\n{{\"type\":\"event\"}}\n{{\"message\":\"hello\"}}"
        ))
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_trusted_envelope_is_forwarded() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let upstream = MockUpstream::start(vec![]).await;
        let raw = envelope(&upstream.dsn("7", None));

        let response = pipeline(&[upstream.trust_entry("7")])
            .process(&ctx(), raw.clone())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body.as_ref(), MockUpstream::OK_BODY.as_bytes());

        let requests = upstream.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/api/7/envelope/");
        assert_eq!(requests[0].body, raw);

        let counters = Counters::capture(&snapshotter);
        assert_eq!(counters.get(ENVELOPE_ACCEPTED), 1);
        assert_eq!(counters.get(ENVELOPE_REJECTED), 0);
        assert_eq!(counters.get(FORWARD_SUCCESS), 1);
        assert_eq!(counters.get(FORWARD_ERROR), 0);
    }

    #[tokio::test]
    async fn test_untrusted_envelope_is_rejected() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let upstream = MockUpstream::start(vec![]).await;
        let raw = envelope(&upstream.dsn("7", Some("key")));

        let err = pipeline(&[upstream.trust_entry("9")])
            .process(&ctx(), raw)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Stage::Trust);
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert!(!err.client_message().contains("/9"));
        assert!(!err.client_message().contains("key"));

        // rejected before any outbound call
        assert!(upstream.requests().is_empty());

        let counters = Counters::capture(&snapshotter);
        assert_eq!(counters.get(ENVELOPE_REJECTED), 1);
        assert_eq!(counters.get(ENVELOPE_ACCEPTED), 0);
        assert_eq!(counters.get(FORWARD_SUCCESS), 0);
        assert_eq!(counters.get(FORWARD_ERROR), 0);
    }

    #[tokio::test]
    async fn test_unframed_envelope_is_rejected() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let upstream = MockUpstream::start(vec![]).await;
        let raw = Bytes::from(format!("{{\"dsn\":\"{}\"}}", upstream.dsn("7", None)));

        let err = pipeline(&[]).process(&ctx(), raw).await.unwrap_err();
        assert!(matches!(err, PipelineError::Parse(ParseError::MalformedEnvelope)));
        assert_eq!(err.stage(), Stage::Parse);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.client_message(), "malformed envelope");
        assert!(upstream.requests().is_empty());

        assert_eq!(Counters::capture(&snapshotter).get(ENVELOPE_REJECTED), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_destination() {
        for (raw, expected) in [
            (&b"{}\n{}"[..], ResolveError::MissingDestination),
            (&b"{\"dsn\":\"\"}\n{}"[..], ResolveError::MissingDestination),
            (&b"{\"dsn\":\"example.com/1\"}\n{}"[..], ResolveError::InvalidDestination),
        ] {
            let err = pipeline(&[])
                .process(&ctx(), Bytes::copy_from_slice(raw))
                .await
                .unwrap_err();
            assert_eq!(err.stage(), Stage::Resolve);
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
            assert!(matches!(err, PipelineError::Resolve(e) if e == expected));
        }
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let port = unreachable_port();
        let raw = envelope(&format!("http://127.0.0.1:{port}/7"));

        let err = pipeline(&[format!("127.0.0.1:{port}/7")])
            .process(&ctx(), raw)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Forward(ForwardError::UpstreamUnavailable { attempts: 5, .. })
        ));
        assert_eq!(err.stage(), Stage::Forward);
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.client_message(), "upstream unavailable");

        // it passed the trust check, so it was accepted
        let counters = Counters::capture(&snapshotter);
        assert_eq!(counters.get(ENVELOPE_ACCEPTED), 1);
        assert_eq!(counters.get(ENVELOPE_REJECTED), 0);
        assert_eq!(counters.get(FORWARD_SUCCESS), 0);
        assert_eq!(counters.get(FORWARD_ERROR), 1);
    }

    #[tokio::test]
    async fn test_upstream_status_is_relayed() {
        let upstream =
            MockUpstream::start(vec![StatusCode::TOO_MANY_REQUESTS, StatusCode::BAD_REQUEST]).await;
        let raw = envelope(&upstream.dsn("7", None));

        let response = pipeline(&[]).process(&ctx(), raw).await.unwrap();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.attempts, 2);
        assert_eq!(response.body.as_ref(), br#"{"detail":"status 400"}"#);
    }

    #[tokio::test]
    async fn test_credential_stripping() {
        let upstream = MockUpstream::start(vec![]).await;
        let raw = envelope(&upstream.dsn("7", Some("public")));

        pipeline(&[upstream.trust_entry("7")])
            .with_credential_stripping(true)
            .process(&ctx(), raw.clone())
            .await
            .unwrap();

        let requests = upstream.requests();
        let forwarded = Envelope::parse(requests[0].body.clone()).unwrap();
        let original = Envelope::parse(raw).unwrap();

        assert_eq!(
            forwarded.header().dsn.as_deref(),
            Some(upstream.dsn("7", None).as_str())
        );
        // the body is untouched
        assert_eq!(forwarded.body(), original.body());
        assert!(
            requests[0]
                .header(SENTRY_AUTH_HEADER)
                .unwrap()
                .contains("sentry_key=public")
        );
    }

    #[tokio::test]
    async fn test_credential_stripping_without_key_is_verbatim() {
        let upstream = MockUpstream::start(vec![]).await;
        let raw = envelope(&upstream.dsn("7", None));

        pipeline(&[])
            .with_credential_stripping(true)
            .process(&ctx(), raw.clone())
            .await
            .unwrap();

        let requests = upstream.requests();
        assert_eq!(requests[0].body, raw);
        assert_eq!(requests[0].header(SENTRY_AUTH_HEADER), None);
    }
}
