use std::io;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0}")]
    Configuration(String),
    #[error("Access denied: path {0} is outside the project root")]
    PathEscape(String),
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("command execution failed: {0}")]
    Execution(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    DataAccess(String),
    #[error("{0}")]
    InvalidArguments(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("network request failed: {0}")]
    Network(String),
    #[error("agent execution failed: {0}")]
    AgentFailed(String),
}

impl SandboxError {
    /// Maps an I/O failure on `path` onto the taxonomy, keeping the path in the message.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SandboxError::NotFound(path.display().to_string()),
            io::ErrorKind::PermissionDenied => {
                SandboxError::PermissionDenied(path.display().to_string())
            }
            _ => SandboxError::Io(err),
        }
    }
}

impl From<sqlx::Error> for SandboxError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => SandboxError::DataAccess(db.message().to_string()),
            other => SandboxError::DataAccess(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
