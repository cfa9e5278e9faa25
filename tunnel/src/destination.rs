use crate::envelope::EnvelopeHeader;
use std::fmt;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error("missing destination")]
    MissingDestination,
    #[error("invalid destination")]
    InvalidDestination,
}

/// Keys embedded in the user info part of a DSN.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub public_key: String,
    pub secret_key: Option<String>,
}

/// An upstream project derived from a DSN.
///
/// The credential is kept apart from the rest of the identity: it never shows
/// up in [`Destination::trust_key`], in the upstream URL or in the `Display`
/// output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    scheme: String,
    /// Host name, with the port appended when it is not the scheme default.
    host: String,
    project_path: String,
    credential: Option<Credential>,
    upstream_url: Url,
}

impl Destination {
    /// Resolves the destination named by the `dsn` field of an envelope header.
    pub fn resolve(header: &EnvelopeHeader) -> Result<Self, ResolveError> {
        let dsn = header
            .dsn
            .as_deref()
            .map(str::trim)
            .filter(|dsn| !dsn.is_empty())
            .ok_or(ResolveError::MissingDestination)?;

        let url = Url::parse(dsn).map_err(|_| ResolveError::InvalidDestination)?;
        Self::from_url(&url)
    }

    pub(crate) fn from_url(url: &Url) -> Result<Self, ResolveError> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(ResolveError::InvalidDestination);
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or(ResolveError::InvalidDestination)?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let project_path = url.path().strip_prefix('/').unwrap_or(url.path());
        if project_path.is_empty() {
            return Err(ResolveError::InvalidDestination);
        }

        let credential = match url.username() {
            "" => None,
            public_key => Some(Credential {
                public_key: public_key.to_string(),
                secret_key: url.password().map(String::from),
            }),
        };

        let upstream_url = Url::parse(&format!("{scheme}://{host}/api/{project_path}/envelope/"))
            .map_err(|_| ResolveError::InvalidDestination)?;

        Ok(Self {
            scheme: scheme.to_string(),
            host,
            project_path: project_path.to_string(),
            credential,
            upstream_url,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn project_path(&self) -> &str {
        &self.project_path
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// The ingestion endpoint: `scheme://host/api/{project_path}/envelope/`.
    pub fn upstream_url(&self) -> &Url {
        &self.upstream_url
    }

    /// `host/project_path`, the identity compared against the trust list.
    pub fn trust_key(&self) -> String {
        format!("{}/{}", self.host, self.project_path)
    }

    /// The DSN with any credential removed.
    pub fn sanitized_dsn(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.host, self.project_path)
    }

    /// Value for the `X-Sentry-Auth` header, when the DSN carried a key.
    pub fn auth_header(&self, client: &str) -> Option<String> {
        let credential = self.credential.as_ref()?;
        let mut value = format!(
            "Sentry sentry_version=7, sentry_client={client}, sentry_key={}",
            credential.public_key
        );
        if let Some(secret) = &credential.secret_key {
            value.push_str(&format!(", sentry_secret={secret}"));
        }
        Some(value)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.project_path)
    }
}
