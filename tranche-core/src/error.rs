use crate::hash::ContentHash;
use crate::topology::HostId;
use std::path::PathBuf;
use thiserror::Error;

/// Precondition failures. Raised before any worker starts; the session is left untouched.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("source does not exist: {0}")]
    MissingSource(PathBuf),
    #[error("source directory contains no uploadable files: {0}")]
    EmptySource(PathBuf),
    #[error("no credentials configured")]
    MissingCredentials,
    #[error("credentials for {0} have expired")]
    ExpiredCredentials(String),
    #[error("no servers selected and unspecified servers are not allowed")]
    NoServersSelected,
    #[error("no reachable core server is writable, online and covers part of the hash space")]
    NoUsableServers,
    #[error("invalid exclude pattern: {0}")]
    BadPattern(#[from] globset::Error),
    #[error("upload session already running or finished")]
    AlreadyStarted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration is locked once the upload has started")]
    Locked,
}

/// Errors reported by a single storage server connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("host {0} unreachable")]
    Unreachable(HostId),
    #[error("host {host} rejected {hash:?}: {reason}")]
    Rejected { host: HostId, hash: ContentHash, reason: String },
    #[error("host {host} I/O failure: {reason}")]
    Io { host: HostId, reason: String },
}

impl StoreError {
    pub fn host(&self) -> &str {
        match self {
            StoreError::Unreachable(host)
            | StoreError::Rejected { host, .. }
            | StoreError::Io { host, .. } => host,
        }
    }
}

/// Per-chunk upload failures. Any of these fails the owning file and halts the session.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no core or non-core host covers {0:?}")]
    NoHosts(ContentHash),
    #[error("only {confirmed} of {required} required core replicas confirmed for {hash:?}")]
    InsufficientReplicas { hash: ContentHash, confirmed: usize, required: usize },
    #[error("non-core host {host} failed for {hash:?}: {reason}")]
    NonCoreFailed { host: HostId, hash: ContentHash, reason: String },
    #[error("upload halted")]
    Halted,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("metadata encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
