//! Error types for mirra

use std::path::PathBuf;
use thiserror::Error;

/// Error types
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source is not an existing directory: {path}")]
    SourceNotADirectory { path: PathBuf },

    #[error("no active session for source: {path}")]
    SessionNotFound { path: PathBuf },

    #[error("target {target} is equal to or inside source {source_path}")]
    TargetInsideSource { target: PathBuf, source_path: PathBuf },

    #[error("target is not an empty directory: {path}")]
    TargetNotEmpty { path: PathBuf },

    #[error("target unavailable: {path}: {reason}")]
    TargetUnavailable { path: PathBuf, reason: String },

    #[error("restore target does not exist: {path}")]
    RestoreTargetMissing { path: PathBuf },

    #[error("event queue is closed")]
    QueueClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Tokenize(String),
}
