//! Error types for kfs-meta

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl MetaError {
    /// Non-zero response code reported to callers.
    pub fn code(&self) -> i32 {
        match self {
            MetaError::NotFound(_) => 404,
            MetaError::Timeout(_) => 408,
            MetaError::InvalidPath(_) | MetaError::InvalidRequest(_) => 400,
            MetaError::ExternalService(_) => 502,
            _ => 500,
        }
    }

    /// Absence is not a failure for most callers.
    pub fn is_not_found(&self) -> bool {
        match self {
            MetaError::NotFound(_) => true,
            MetaError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for MetaError {
    fn from(e: reqwest::Error) -> Self {
        MetaError::ExternalService(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_non_zero() {
        assert_eq!(MetaError::NotFound("x".into()).code(), 404);
        assert_eq!(MetaError::Timeout("x".into()).code(), 408);
        assert_eq!(MetaError::Persistence("x".into()).code(), 500);
        assert_eq!(MetaError::ExternalService("x".into()).code(), 502);
    }

    #[test]
    fn test_io_not_found_counts_as_absence() {
        let err = MetaError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(!MetaError::State("poisoned".into()).is_not_found());
    }
}
