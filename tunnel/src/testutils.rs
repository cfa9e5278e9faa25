use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use metrics_util::debugging::{DebugValue, Snapshotter};
use shared::metrics_defs::MetricDef;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct MockState {
    statuses: VecDeque<StatusCode>,
    delay: Option<Duration>,
    requests: Vec<RecordedRequest>,
}

/// An ingestion endpoint stand-in that records every request it gets.
pub struct MockUpstream {
    pub port: u16,
    state: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    pub const OK_BODY: &'static str = r#"{"id":"fc6d8c0c43fc4630ad850ee518f1b9d0"}"#;

    /// Answers with `statuses` in order, then with 200 for every later request.
    pub async fn start(statuses: Vec<StatusCode>) -> Self {
        Self::spawn(MockState {
            statuses: statuses.into(),
            ..Default::default()
        })
        .await
    }

    /// Answers 200, but only after `delay`.
    pub async fn start_with_delay(delay: Duration) -> Self {
        Self::spawn(MockState {
            delay: Some(delay),
            ..Default::default()
        })
        .await
    }

    async fn spawn(state: MockState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(Mutex::new(state));
        let server_state = state.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let io = TokioIo::new(stream);
                let state = server_state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(state.clone(), req));
                    if let Err(err) =
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                    {
                        eprintln!("Error serving connection: {:?}", err);
                    }
                });
            }
        });

        MockUpstream { port, state }
    }

    pub fn dsn(&self, project: &str, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("http://{key}@127.0.0.1:{}/{project}", self.port),
            None => format!("http://127.0.0.1:{}/{project}", self.port),
        }
    }

    pub fn trust_entry(&self, project: &str) -> String {
        format!("127.0.0.1:{}/{project}", self.port)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

async fn handle(
    state: Arc<Mutex<MockState>>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_else(|_| Bytes::new());

    let (status, delay) = {
        let mut state = state.lock().unwrap();
        state.requests.push(RecordedRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            headers: parts.headers,
            body,
        });
        (
            state.statuses.pop_front().unwrap_or(StatusCode::OK),
            state.delay,
        )
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let body = match status.is_success() {
        true => MockUpstream::OK_BODY.to_string(),
        false => format!(r#"{{"detail":"status {}"}}"#, status.as_u16()),
    };

    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

/// A local port nothing listens on.
pub fn unreachable_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Counter values captured from a debugging recorder.
pub struct Counters(HashMap<String, u64>);

impl Counters {
    pub fn capture(snapshotter: &Snapshotter) -> Self {
        let values = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(value) => Some((key.key().name().to_string(), value)),
                _ => None,
            })
            .collect();
        Counters(values)
    }

    pub fn get(&self, def: MetricDef) -> u64 {
        self.0.get(def.name).copied().unwrap_or(0)
    }
}
