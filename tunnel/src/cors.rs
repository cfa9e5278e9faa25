use crate::forwarder::TUNNEL_ID_HEADER;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
    HeaderMap, HeaderValue, VARY,
};

const ALLOWED_METHODS: &str = "POST, OPTIONS";
const DEFAULT_ALLOWED_HEADERS: &str = "content-type";
const MAX_AGE_SECS: &str = "86400";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("untrusted origin")]
pub struct UntrustedOrigin;

/// Cross-origin policy for browser SDKs posting to the tunnel.
#[derive(Clone, Debug, Default)]
pub struct Cors {
    /// `None` allows every origin.
    allowed: Option<Vec<String>>,
}

impl Cors {
    /// An empty list, or one containing `*`, allows every origin.
    pub fn new(origins: &[String]) -> Self {
        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            return Cors { allowed: None };
        }

        let allowed = origins
            .iter()
            .map(|o| o.trim().trim_end_matches('/').to_ascii_lowercase())
            .collect();
        Cors {
            allowed: Some(allowed),
        }
    }

    /// Checks the `Origin` request header.
    ///
    /// Returns the value to echo in `Access-Control-Allow-Origin`, or `None`
    /// for requests without an origin, which are not cross-origin requests.
    pub fn allow_origin(
        &self,
        origin: Option<&HeaderValue>,
    ) -> Result<Option<HeaderValue>, UntrustedOrigin> {
        let Some(origin) = origin else {
            return Ok(None);
        };

        let Some(allowed) = &self.allowed else {
            return Ok(Some(origin.clone()));
        };

        let value = origin
            .to_str()
            .map_err(|_| UntrustedOrigin)?
            .trim_end_matches('/')
            .to_ascii_lowercase();

        match allowed.contains(&value) {
            true => Ok(Some(origin.clone())),
            false => Err(UntrustedOrigin),
        }
    }

    /// Headers added to every response to an allowed cross-origin request.
    pub fn apply(&self, headers: &mut HeaderMap, allowed_origin: Option<HeaderValue>) {
        let Some(origin) = allowed_origin else {
            return;
        };
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.append(VARY, HeaderValue::from_static("origin"));
        headers.insert(
            ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(TUNNEL_ID_HEADER),
        );
    }

    /// Headers answering a preflight request, on top of [`Cors::apply`].
    pub fn apply_preflight(&self, headers: &mut HeaderMap, request_headers: &HeaderMap) {
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        let allow_headers = request_headers
            .get(ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned()
            .unwrap_or(HeaderValue::from_static(DEFAULT_ALLOWED_HEADERS));
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE_SECS));
    }
}
