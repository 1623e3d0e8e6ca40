use axum::http::StatusCode;

/// Failure reported by a document store read, write or subscription.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid document at {path}: {message}")]
    InvalidDocument { path: String, message: String },
    #[error("io error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn invalid(path: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidDocument {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),
    #[error("habit not found: {0}")]
    HabitNotFound(String),
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("session has been disposed")]
    Disposed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::Validation(_) => StatusCode::BAD_REQUEST,
            SessionError::HabitNotFound(_) | SessionError::TransactionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            SessionError::Disposed => StatusCode::CONFLICT,
            SessionError::Store(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        SessionError::from(err).into()
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (self.status, self.message).into_response()
    }
}
