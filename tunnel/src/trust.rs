use crate::destination::Destination;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TrustListError {
    #[error("trusted DSN #{0} must not contain a public or secret key")]
    CredentialInEntry(usize),
    #[error("trusted DSN #{0} is invalid: {1}")]
    InvalidEntry(usize, String),
}

/// Returned when a destination is not on the trust list.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("untrusted destination: {destination}")]
pub struct TrustRejected {
    /// The rejected `host/project_path`.
    pub destination: String,
}

/// The set of destinations the tunnel may forward to.
///
/// Entries are stored as `host/project_path` strings and compared with
/// [`Destination::trust_key`] by exact equality. Both sides come out of the
/// same URL parser, so host case and default ports are normalized while the
/// project path is compared as is. An empty list trusts every destination.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustList {
    entries: Vec<String>,
}

impl TrustList {
    pub fn trust_all() -> Self {
        Self::default()
    }

    /// Builds the list from configured DSNs.
    ///
    /// Entries may be full DSNs (`https://sentry.example.com/1`) or
    /// `host[:port]/project` pairs (`sentry.example.com/1`). A pair naming
    /// port 80 or 443 is refused, those need a scheme. Entries carrying a key
    /// are refused: keys belong to the clients, not to the trust list.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, TrustListError> {
        let mut keys: Vec<String> = Vec::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                return Err(TrustListError::InvalidEntry(index, "empty entry".into()));
            }

            let key = if entry.contains("://") {
                entry_key(index, entry)?
            } else {
                // Without a scheme, 80 and 443 would be elided for one scheme
                // and kept for the other, so the entry must mean the same
                // thing under both.
                let https = entry_key(index, &format!("https://{entry}"))?;
                let http = entry_key(index, &format!("http://{entry}"))?;
                if https != http {
                    return Err(TrustListError::InvalidEntry(
                        index,
                        "a default port needs an explicit scheme".into(),
                    ));
                }
                https
            };

            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        Ok(Self { entries: keys })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn check(&self, destination: &Destination) -> Result<(), TrustRejected> {
        if self.entries.is_empty() {
            return Ok(());
        }

        let key = destination.trust_key();
        if self.entries.iter().any(|entry| *entry == key) {
            Ok(())
        } else {
            Err(TrustRejected { destination: key })
        }
    }
}

fn entry_key(index: usize, entry: &str) -> Result<String, TrustListError> {
    let url = Url::parse(entry).map_err(|e| TrustListError::InvalidEntry(index, e.to_string()))?;

    if !url.username().is_empty() || url.password().is_some() {
        return Err(TrustListError::CredentialInEntry(index));
    }

    Destination::from_url(&url)
        .map(|destination| destination.trust_key())
        .map_err(|e| TrustListError::InvalidEntry(index, e.to_string()))
}
