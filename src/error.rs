use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the sdk facade and the layers underneath it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    /// No usable `dnslink=/hyper/` TXT record was found for the hostname.
    /// The label names the record a site operator would need to add.
    #[error("no dnslink record found, expected a TXT record at {label} containing \"dnslink=/hyper/<key>\"")]
    DnsLinkNotFound { label: String },
    #[error("dns lookup failed: {0}")]
    Network(String),
    /// Another live instance already holds the lock on this storage directory.
    #[error("storage at {path:?} is already in use by another instance")]
    StorageConflict { path: PathBuf },
    #[error("identifier resolved to neither a key nor a name")]
    UnresolvedIdentifier,
    #[error("resource is closed")]
    Closed,
    #[error("resource is not writable")]
    NotWritable,
    #[error("storage corrupted: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Db(#[from] sled::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// One or more resources failed while tearing the instance down. The
    /// remaining resources were still closed before this was returned.
    #[error("{failed} of {total} resources failed to close, first failure: {first}")]
    ShutdownFailed {
        failed: usize,
        total: usize,
        first: String,
    },
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}
