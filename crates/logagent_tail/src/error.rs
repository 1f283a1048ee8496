use std::io;
use thiserror::Error;

/// Task setup errors. Always recoverable at the granularity of one entry.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not a regular file")]
    NotAFile { path: String },

    #[error("Task for {path} is already initialized")]
    AlreadyInitialized { path: String },

    #[error("Task for {path} failed to initialize: {message}")]
    Init { path: String, message: String },

    #[error("Failed to spawn thread for {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl TaskError {
    pub fn path(&self) -> &str {
        match self {
            TaskError::Open { path, .. }
            | TaskError::NotAFile { path }
            | TaskError::AlreadyInitialized { path }
            | TaskError::Init { path, .. }
            | TaskError::Spawn { path, .. } => path,
        }
    }
}

/// The bus refused a message.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Bus channel closed")]
    Closed,

    #[error("Publish failed: {0}")]
    Other(String),
}

/// Errors surfaced by the task manager itself (never by individual tasks).
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Task manager requires a running tokio runtime")]
    NoRuntime,

    #[error("Task manager has stopped")]
    Stopped,

    #[error("Task manager loop failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
