use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a remote backend call did not produce a usable result
#[derive(Error, Debug)]
pub enum RemoteCause {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend returned an unusable reference: {0}")]
    InvalidReference(String),
}

impl RemoteCause {
    pub fn backend(message: impl Into<String>) -> Self {
        RemoteCause::Backend(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteCause::Timeout(_))
    }
}

/// Errors raised by individual publishing steps
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("local {operation} failed for {}: {source}", .path.display())]
    LocalIo {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("remote {operation} failed: {cause}")]
    RemotePublish {
        operation: &'static str,
        #[source]
        cause: RemoteCause,
    },

    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl PublishError {
    pub fn local_io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        PublishError::LocalIo {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn remote(operation: &'static str, cause: RemoteCause) -> Self {
        PublishError::RemotePublish { operation, cause }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        PublishError::MalformedInput(message.into())
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::LocalIo { .. } => "LOCAL_IO_ERROR",
            PublishError::RemotePublish { cause, .. } if cause.is_timeout() => "REMOTE_TIMEOUT",
            PublishError::RemotePublish { .. } => "REMOTE_PUBLISH_ERROR",
            PublishError::MalformedInput(_) => "MALFORMED_INPUT",
        }
    }
}
