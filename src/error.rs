use thiserror::Error;

/// Failure category used by the device loops to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Conflict,
    Transient,
    Timeout,
    Cancelled,
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("device '{0}' already exists")]
    AlreadyExists(String),

    #[error("transient hub failure: {0}")]
    Transient(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("fatal hub failure: {0}")]
    Fatal(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<HubError> },
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::AlreadyExists(_) => ErrorKind::Conflict,
            HubError::Transient(_) => ErrorKind::Transient,
            HubError::Timeout(_) => ErrorKind::Timeout,
            HubError::Cancelled => ErrorKind::Cancelled,
            HubError::Fatal(_) | HubError::RetriesExhausted { .. } => ErrorKind::Fatal,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        HubError::Transient(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        HubError::Timeout(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HubError::Fatal(message.into())
    }
}

impl From<tokio::time::error::Elapsed> for HubError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        HubError::Timeout(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Fatal(format!("payload serialization failed: {}", err))
    }
}

pub type HubResult<T> = std::result::Result<T, HubError>;
