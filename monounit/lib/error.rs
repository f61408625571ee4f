use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a monounit-related operation.
pub type MonounitResult<T> = Result<T, MonounitError>;

/// An error that occurred while driving a backend, a pipeline or the local stores.
#[derive(Debug, Error)]
pub enum MonounitError {
    /// A spec, name, port mapping or reference is malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The backend lacks the disk, memory or ports a request needs.
    #[error("insufficient resources: {0}")]
    ResourceExhaustion(String),

    /// The backend is unreachable or is not running.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// A call to the backend failed or a command exited with a non-zero status.
    #[error("operation failed: {0}")]
    Operation(String),

    /// The request collides with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An image, unit, remote or device does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The running pipeline was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Multiple validation errors collected from a spec document.
    #[error("spec validation errors: {0:?}")]
    SpecValidationErrors(Vec<String>),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred in the unit registry database.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error that occurred while migrating the unit registry database.
    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error that occurred while (de)serializing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred while (de)serializing YAML.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// The class an error belongs to, independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input. Raised before any mutation.
    Validation,

    /// Insufficient capacity. Raised before any mutation.
    ResourceExhaustion,

    /// The backend could not be reached.
    Connectivity,

    /// A backend call failed.
    Operation,

    /// Duplicate or otherwise colliding state.
    Conflict,

    /// Something referenced does not exist.
    NotFound,

    /// The operation was cancelled.
    Cancelled,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MonounitError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> MonounitError {
        MonounitError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns the class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MonounitError::Validation(_)
            | MonounitError::SpecValidationErrors(_)
            | MonounitError::Json(_)
            | MonounitError::Yaml(_) => ErrorKind::Validation,
            MonounitError::ResourceExhaustion(_) => ErrorKind::ResourceExhaustion,
            MonounitError::Connectivity(_) => ErrorKind::Connectivity,
            MonounitError::HttpRequest(e) if e.is_connect() || e.is_timeout() => {
                ErrorKind::Connectivity
            }
            MonounitError::Conflict(_) => ErrorKind::Conflict,
            MonounitError::NotFound(_) => ErrorKind::NotFound,
            MonounitError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Operation,
        }
    }

    /// Returns true if this error was raised because the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MonounitError::Cancelled)
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `MonounitResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> MonounitResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            MonounitError::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            MonounitError::SpecValidationErrors(vec![]).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            MonounitError::ResourceExhaustion("disk".into()).kind(),
            ErrorKind::ResourceExhaustion
        );
        assert_eq!(
            MonounitError::Conflict("cycle".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            MonounitError::Io(std::io::Error::other("boom")).kind(),
            ErrorKind::Operation
        );
        assert!(MonounitError::Cancelled.is_cancelled());
    }
}
