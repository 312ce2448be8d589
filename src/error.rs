//! Engine error types

use serde::Serialize;
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timezone error: {0}")]
    Timezone(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, used in log fields and by read-only consumers
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Timezone(_) => "TIMEZONE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Io(_))
    }
}

/// Serializable error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        ErrorResponse::from(self).serialize(serializer)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::NotFound("NSE".into()).code(), "NOT_FOUND");
        assert_eq!(AppError::Timezone("Mars/Base".into()).code(), "TIMEZONE_ERROR");
    }

    #[test]
    fn test_transient_classification() {
        let db = AppError::Database(rusqlite::Error::QueryReturnedNoRows);
        assert!(db.is_transient());
        assert!(!AppError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn test_serializes_as_error_response() {
        let err = AppError::Config("missing timezone".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "CONFIG_ERROR");
        assert_eq!(json["message"], "Configuration error: missing timezone");
    }
}
