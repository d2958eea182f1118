use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The crate's error type.
///
/// Cryptographic variants carry only generic messages; key material and
/// plaintext never reach an error value.
#[derive(Error, Debug)]
pub enum AppError {
    /// A database error.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// A connection pool error.
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// A Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Malformed input to a create/encrypt call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A missing record.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The referenced key is missing, inactive or expired.
    #[error("Encryption key not found")]
    KeyNotFound,

    /// The parent key needed to wrap a child key is unusable.
    #[error("Parent key is missing, inactive or expired")]
    MissingParentKey,

    /// A time boundary was crossed.
    #[error("Expired: {0}")]
    Expired(String),

    /// AEAD tag verification failed.
    #[error("Integrity check failed")]
    Integrity,

    /// A quota or rate limit was exceeded.
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// An invalid policy value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// RNG or KDF failure.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// The request method is not on the allow list.
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The client IP is blocked or not on the allow list.
    #[error("IP address not allowed: {0}")]
    IpNotAllowed(String),

    /// An encryption error other than an integrity failure.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// A missing column while mapping a row.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// An authentication error.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// An internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Pool(ref e) => {
                tracing::error!("Connection pool error: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Database unavailable".to_string())
            }

            AppError::Redis(ref e) => {
                tracing::error!("Redis error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cache error".to_string())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::NotFound(ref what) => {
                tracing::debug!("Not found: {}", what);
                (StatusCode::NOT_FOUND, "Resource not found".to_string())
            }

            AppError::KeyNotFound | AppError::MissingParentKey => {
                tracing::debug!("{}", self);
                (StatusCode::NOT_FOUND, self.to_string())
            }

            AppError::Expired(ref msg) => {
                tracing::debug!("Expired: {}", msg);
                (StatusCode::GONE, msg.clone())
            }

            AppError::Integrity => {
                tracing::warn!("AEAD integrity check failed");
                (StatusCode::UNPROCESSABLE_ENTITY, "Integrity check failed".to_string())
            }

            AppError::LimitExceeded(ref msg) => {
                tracing::warn!("Limit exceeded: {}", msg);
                (StatusCode::TOO_MANY_REQUESTS, msg.clone())
            }

            AppError::Configuration(ref msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error".to_string())
            }

            AppError::KeyGeneration(ref msg) => {
                tracing::error!("Key generation failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Key generation failed".to_string())
            }

            AppError::MethodNotAllowed(ref method) => {
                tracing::debug!("Method not allowed: {}", method);
                (StatusCode::METHOD_NOT_ALLOWED, self.to_string())
            }

            AppError::IpNotAllowed(ref ip) => {
                tracing::warn!("IP address not allowed: {}", ip);
                (StatusCode::FORBIDDEN, "Forbidden".to_string())
            }

            AppError::Encryption(ref msg) => {
                tracing::error!("Encryption error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Encryption error".to_string())
            }

            AppError::MissingData(ref column) => {
                tracing::error!("Missing column while mapping row: {}", column);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Authentication(ref msg) => {
                tracing::warn!("Authentication failed: {}", msg);
                (StatusCode::UNAUTHORIZED, msg.clone())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        (status, [(axum::http::header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}
