use crate::config::ValidationError;
use crate::trust::TrustListError;
use std::io;

/// Errors that keep the tunnel from starting or serving.
#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),
    #[error("trust list error: {0}")]
    TrustList(#[from] TrustListError),
    #[error("upstream client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}
