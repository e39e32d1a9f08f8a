use actix_web::{HttpResponse, http::StatusCode};
use thiserror::Error;

pub type Res<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    // === CONVERSION ERRORS ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    RedisPool(#[from] deadpool_redis::PoolError),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === APPLICATION ERRORS ===
    #[error("Authorization error: {0}")]
    Unauthorized(String),

    #[error("Quota reached: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Too Many Requests: {0}")]
    TooManyRequests(String),

    #[error("Already restored: {0}")]
    Conflict(String),

    #[error("Invalid value: {0}")]
    Validation(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Backend unreachable: {0}")]
    BadGateway(String),

    #[error("Backend timeout: {0}")]
    GatewayTimeout(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::RedisPool(_)
            | AppError::Reqwest(_)
            | AppError::Json(_)
            | AppError::Unavailable(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Storage and transport failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Unavailable(_) | AppError::Redis(_) | AppError::RedisPool(_) => true,
            AppError::Database(error) => matches!(
                error,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    /// Message safe to hand to a client. Storage detail stays in the logs.
    pub fn public_message(&self) -> String {
        let is_dev = cfg!(debug_assertions);
        let is_backend = matches!(self, AppError::BadGateway(_) | AppError::GatewayTimeout(_));
        if self.status().is_server_error() && !is_backend {
            log::error!("{}", self);
            if !is_dev {
                return "Internal server error".to_string();
            }
        }
        self.to_string()
    }

    pub fn to_http_response(&self) -> HttpResponse {
        HttpResponse::build(self.status()).json(serde_json::json!({ "error": self.public_message() }))
    }
}

impl actix_web::ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        self.to_http_response()
    }
}
