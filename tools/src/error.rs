//! Error taxonomy for the filesystem, document, and web tool primitives.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("out of policy: {0}")]
    OutOfPolicy(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ToolError::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => ToolError::AlreadyExists(err.to_string()),
            _ => ToolError::Io(err.to_string()),
        }
    }
}
