use crate::config::Config;
use crate::context::RequestContext;
use crate::cors::Cors;
use crate::errors::TunnelError;
use crate::forwarder::{Forwarder, RetryPolicy, TUNNEL_ID_HEADER, USER_AGENT, UpstreamResponse};
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_IN_FLIGHT};
use crate::pipeline::{Pipeline, PipelineError, Stage};
use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE, ORIGIN, SERVER};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Limited, LengthLimitError};
use hyper::body::Body;
use hyper::service::Service;
use shared::http::full_body;
use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type TunnelBody = BoxBody<Bytes, Infallible>;

/// How long past the request deadline the handler may still run. The
/// forwarder observes the deadline itself, this only catches what does not.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

/// Serves the tunnel endpoint.
///
/// `POST {path}` runs the envelope through the [`Pipeline`] and relays the
/// upstream answer. `OPTIONS {path}` answers CORS preflights. Every response
/// carries the request's `X-Sentry-Tunnel-Id` and a `Server` header.
#[derive(Clone)]
pub struct TunnelService {
    handler: Arc<TunnelHandler>,
}

impl TunnelService {
    pub fn new(config: &Config) -> Result<Self, TunnelError> {
        let forwarder = Forwarder::new(RetryPolicy::from(&config.retry), config.attempt_timeout())?;
        let pipeline = Pipeline::new(Arc::new(config.trust_list()?), forwarder)
            .with_credential_stripping(config.strip_dsn_credentials);

        Ok(TunnelService {
            handler: Arc::new(TunnelHandler {
                path: config.path.clone(),
                pipeline,
                cors: Cors::new(&config.allowed_origins),
                request_timeout: config.request_timeout(),
                max_envelope_bytes: config.max_envelope_bytes,
            }),
        })
    }
}

impl<B> Service<Request<B>> for TunnelService
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<TunnelBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let handler = self.handler.clone();
        Box::pin(async move { Ok(handler.handle(req).await) })
    }
}

struct TunnelHandler {
    path: String,
    pipeline: Pipeline,
    cors: Cors,
    request_timeout: Duration,
    max_envelope_bytes: usize,
}

/// Keeps the in-flight gauge right when a connection drops mid-request.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        shared::gauge!(REQUESTS_IN_FLIGHT).increment(1.0);
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        shared::gauge!(REQUESTS_IN_FLIGHT).decrement(1.0);
    }
}

impl TunnelHandler {
    async fn handle<B>(self: Arc<Self>, req: Request<B>) -> Response<TunnelBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let _in_flight = InFlight::enter();
        let ctx = RequestContext::new(self.request_timeout);
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut response = self.route(&ctx, req).await;
        let headers = response.headers_mut();
        headers.insert(TUNNEL_ID_HEADER, ctx.tunnel_id.header_value());
        headers.insert(SERVER, HeaderValue::from_static(USER_AGENT));

        let status = response.status();
        let elapsed = ctx.received_at.elapsed();
        shared::histogram!(REQUEST_DURATION, "status" => status.as_u16().to_string())
            .record(elapsed.as_secs_f64());
        tracing::info!(
            tunnel_id = %ctx.tunnel_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "request completed"
        );

        response
    }

    async fn route<B>(self: &Arc<Self>, ctx: &RequestContext, req: Request<B>) -> Response<TunnelBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if req.uri().path() != self.path {
            return error_response(StatusCode::NOT_FOUND, "not found");
        }

        let allowed_origin = match self.cors.allow_origin(req.headers().get(ORIGIN)) {
            Ok(origin) => origin,
            Err(e) => {
                tracing::info!(tunnel_id = %ctx.tunnel_id, origin = ?req.headers().get(ORIGIN), "origin not allowed");
                return error_response(StatusCode::FORBIDDEN, &e.to_string());
            }
        };

        let method = req.method().clone();
        let mut response = match method {
            Method::POST => self.tunnel(ctx, req.into_body()).await,
            Method::OPTIONS => {
                let mut response = Response::new(full_body(Bytes::new()));
                *response.status_mut() = StatusCode::NO_CONTENT;
                self.cors
                    .apply_preflight(response.headers_mut(), req.headers());
                response
            }
            _ => {
                let mut response =
                    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static("POST, OPTIONS"));
                response
            }
        };

        self.cors.apply(response.headers_mut(), allowed_origin);
        response
    }

    async fn tunnel<B>(self: &Arc<Self>, ctx: &RequestContext, body: B) -> Response<TunnelBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let raw = match self.read_body(ctx, body).await {
            Ok(raw) => raw,
            Err(response) => return response,
        };

        let handler = self.clone();
        let task_ctx = ctx.clone();
        let result = run_guarded(ctx, async move {
            handler.pipeline.process(&task_ctx, raw).await
        })
        .await;

        match result {
            Ok(Ok(upstream)) => relay(upstream),
            Ok(Err(e)) => {
                log_failure(ctx, &e);
                error_response(e.status_code(), &e.client_message())
            }
            Err(Interrupted::TimedOut) => {
                tracing::warn!(tunnel_id = %ctx.tunnel_id, "request deadline exceeded, handler aborted");
                error_response(StatusCode::GATEWAY_TIMEOUT, "request timed out")
            }
            Err(Interrupted::Panicked) | Err(Interrupted::Cancelled) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    async fn read_body<B>(&self, ctx: &RequestContext, body: B) -> Result<Bytes, Response<TunnelBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let limited = Limited::new(body, self.max_envelope_bytes);

        match timeout_at(ctx.deadline, limited.collect()).await {
            Ok(Ok(collected)) => Ok(collected.to_bytes()),
            Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
                tracing::info!(
                    tunnel_id = %ctx.tunnel_id,
                    limit = self.max_envelope_bytes,
                    "envelope too large"
                );
                Err(error_response(StatusCode::PAYLOAD_TOO_LARGE, "envelope too large"))
            }
            Ok(Err(e)) => {
                tracing::info!(tunnel_id = %ctx.tunnel_id, error = %e, "failed to read request body");
                Err(error_response(StatusCode::BAD_REQUEST, "unreadable request body"))
            }
            Err(_) => {
                tracing::info!(tunnel_id = %ctx.tunnel_id, "timed out reading request body");
                Err(error_response(StatusCode::REQUEST_TIMEOUT, "request timed out"))
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupted {
    Panicked,
    Cancelled,
    TimedOut,
}

/// Runs `work` on its own task so that a panic stays contained to the request
/// and the task can be aborted once the deadline has passed.
async fn run_guarded<F>(ctx: &RequestContext, work: F) -> Result<F::Output, Interrupted>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let task = tokio::spawn(work);
    let abort = task.abort_handle();

    tokio::select! {
        biased;
        joined = task => match joined {
            Ok(output) => Ok(output),
            Err(e) if e.is_panic() => {
                report_panic(ctx, e.into_panic());
                Err(Interrupted::Panicked)
            }
            Err(_) => Err(Interrupted::Cancelled),
        },
        _ = sleep_until(ctx.deadline + DEADLINE_GRACE) => {
            abort.abort();
            Err(Interrupted::TimedOut)
        }
    }
}

fn report_panic(ctx: &RequestContext, payload: Box<dyn Any + Send>) {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());

    sentry::with_scope(
        |scope| scope.set_tag("tunnel_id", ctx.tunnel_id),
        || tracing::error!(tunnel_id = %ctx.tunnel_id, panic = %message, "request handler panicked"),
    );
}

fn log_failure(ctx: &RequestContext, error: &PipelineError) {
    match error.stage() {
        Stage::Parse | Stage::Resolve | Stage::Trust => tracing::info!(
            tunnel_id = %ctx.tunnel_id,
            stage = %error.stage(),
            error = %error,
            "envelope rejected"
        ),
        Stage::Forward => tracing::warn!(
            tunnel_id = %ctx.tunnel_id,
            stage = %error.stage(),
            error = %error,
            "forwarding failed"
        ),
    }
}

fn relay(upstream: UpstreamResponse) -> Response<TunnelBody> {
    let mut response = Response::new(full_body(upstream.body));
    *response.status_mut() = upstream.status;
    if let Some(content_type) = upstream.content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<TunnelBody> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
