//! A stand-in for an upstream ingestion service, for trying out the tunnel
//! locally without a real Sentry installation.

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{full_body, make_boxed_error_response, run_http_service};
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

const BANNER: &str = "sentrytunnel stub server\n";

pub async fn run(
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    run_http_service(
        host,
        port,
        service_fn(handle),
        shutdown,
        Duration::from_secs(1),
    )
    .await
}

async fn handle(req: Request<Incoming>) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, envelope_project(&path)) {
        (Method::GET, _) if path == "/" => Response::new(full_body(BANNER)),
        (Method::POST, Some(project)) => {
            let size = match req.into_body().collect().await {
                Ok(body) => body.to_bytes().len(),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read envelope");
                    return Ok(make_boxed_error_response(StatusCode::BAD_REQUEST));
                }
            };
            tracing::info!(project, size, "received envelope");

            let mut response = Response::new(full_body(r#"{"status":"ok"}"#));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
            response
        }
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    };

    Ok(response)
}

/// Extracts `{project}` from `/api/{project}/envelope/`.
fn envelope_project(path: &str) -> Option<&str> {
    let project = path.strip_prefix("/api/")?.strip_suffix("/envelope/")?;
    match project.is_empty() {
        true => None,
        false => Some(project),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_project() {
        assert_eq!(envelope_project("/api/7/envelope/"), Some("7"));
        assert_eq!(envelope_project("/api/org/7/envelope/"), Some("org/7"));
        assert_eq!(envelope_project("/api//envelope/"), None);
        assert_eq!(envelope_project("/api/7/envelope"), None);
        assert_eq!(envelope_project("/api/7/store/"), None);
        assert_eq!(envelope_project("/"), None);
    }
}
