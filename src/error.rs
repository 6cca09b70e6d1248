use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::monitor::{MonitorState, StreamKind};

/// Failures reported by a [`RemoteShareMount`](crate::share::RemoteShareMount).
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("remote host must not be empty")]
    EmptyHost,
    #[error("authentication failed for {unc}")]
    Authentication { unc: String },
    #[error("network path {unc} is unreachable")]
    NetworkUnreachable { unc: String },
    #[error("{unc} is already mounted by another owner")]
    AlreadyMounted { unc: String },
    #[error("no mount found for {unc}")]
    MountNotFound { unc: String },
    #[error("mount operation on {unc} failed: {reason}")]
    Platform { unc: String, reason: String },
}

/// Failures opening or running a change stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to open change stream: {0}")]
    Open(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to spawn delivery thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("change stream terminated: {0}")]
    Terminated(String),
}

/// An append to an export file failed.
#[derive(Debug, Error)]
#[error("failed to append to {}: {source}", .path.display())]
pub struct ExportError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{0}` must not be empty")]
    Empty(&'static str),
    #[error("`{field}` must not contain path separators: {value:?}")]
    Separator { field: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to prepare export directory {}: {source}", .path.display())]
    TargetDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("adapter rejected remote database {path}: {source}")]
    Adapter {
        path: String,
        #[source]
        source: StreamError,
    },
    #[error("subscription to the {stream} stream failed: {source}")]
    StreamSubscription {
        stream: StreamKind,
        #[source]
        source: StreamError,
    },
    #[error("monitor cannot start while {0}")]
    InvalidState(MonitorState),
}
