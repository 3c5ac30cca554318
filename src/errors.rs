use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("UPSTREAM_UNAVAILABLE: {0}")]
    UpstreamUnavailable(String),
    #[error("VALIDATION_FAILED: {0}")]
    Validation(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("ACCESS_DENIED: {0}")]
    AccessDenied(String),
    #[error("FORMAT_COERCION: {0}")]
    FormatCoercion(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Storage and filesystem failures on a read path mean the backing tier
    /// could not be reached; everything else keeps its own classification.
    pub fn into_upstream(self) -> Self {
        match self {
            Self::Io(message) | Self::Internal(message) => Self::UpstreamUnavailable(message),
            other => other,
        }
    }

    /// The message without its code prefix, for user-facing status lines.
    pub fn detail(&self) -> &str {
        match self {
            Self::UpstreamUnavailable(message)
            | Self::Validation(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::AccessDenied(message)
            | Self::FormatCoercion(message)
            | Self::Io(message)
            | Self::Internal(message) => message,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Validation(format!("invalid configuration: {}", value))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn storage_failures_become_upstream_unavailable() {
        let err = AppError::Internal("database is locked".to_string()).into_upstream();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));

        let kept = AppError::Validation("no plans".to_string()).into_upstream();
        assert!(matches!(kept, AppError::Validation(_)));
    }

    #[test]
    fn display_carries_error_code_prefix() {
        let err = AppError::Conflict("User ID already exists".to_string());
        assert_eq!(err.to_string(), "CONFLICT: User ID already exists");
        assert_eq!(err.detail(), "User ID already exists");
    }
}
