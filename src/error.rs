// src/error.rs

use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

pub const CONTENT_FLAGGED_MESSAGE: &str =
    "The model flagged sensitive content in the image or the prompt. Please try again with different inputs.";

/// Why a generation attempt did not produce an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("input flagged as sensitive: {0}")]
    ContentFlagged(String),

    #[error("generation did not finish after {attempts} status checks")]
    Timeout { attempts: u32 },

    #[error("inference provider failure: {0}")]
    ProviderFailure(String),
}

impl GenerationError {
    /// Sorts a provider error message into `ContentFlagged` or `ProviderFailure`.
    pub fn from_provider_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_lowercase().contains("sensitive") {
            GenerationError::ContentFlagged(message)
        } else {
            GenerationError::ProviderFailure(message)
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object store request failed: {0}")]
    Backend(String),

    #[error("content type {0} is not accepted")]
    UnsupportedContentType(String),

    #[error("object of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Error, Debug)]
pub enum PaymentGatewayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("payment gateway error status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Error, Debug)]
pub enum WebhookSignatureError {
    #[error("missing signature header")]
    MissingHeader,

    #[error("malformed signature header")]
    MalformedHeader,

    #[error("signature timestamp outside tolerance")]
    Expired,

    #[error("no signature matches the payload")]
    Mismatch,

    #[error("event payload is not valid JSON: {0}")]
    InvalidPayload(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("project not found")]
    NotFound,

    #[error("payment is required before generation")]
    PaymentRequired,

    #[error("insufficient credits")]
    InsufficientCredits,

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Payment(#[from] PaymentGatewayError),

    #[error("invalid webhook: {0}")]
    WebhookSignature(#[from] WebhookSignatureError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Message that is safe to show to the caller.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Generation(GenerationError::ContentFlagged(_)) => {
                CONTENT_FLAGGED_MESSAGE.to_string()
            }
            AppError::Generation(GenerationError::Timeout { .. }) => {
                "Generation is taking too long, please try again later.".to_string()
            }
            AppError::Generation(GenerationError::ProviderFailure(_)) => {
                "Image generation failed.".to_string()
            }
            AppError::Storage(StorageError::UnsupportedContentType(_))
            | AppError::Storage(StorageError::TooLarge { .. }) => self.to_string(),
            AppError::Storage(_) => "Storage error.".to_string(),
            AppError::Payment(_) => "Payment provider error.".to_string(),
            AppError::Notification(_) => "Notification error.".to_string(),
            AppError::Database(_) | AppError::Config(_) => "Internal server error.".to_string(),
            other => other.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::PaymentRequired | AppError::InsufficientCredits => {
                StatusCode::PAYMENT_REQUIRED
            }
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Generation(GenerationError::ContentFlagged(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::Generation(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(StorageError::UnsupportedContentType(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            AppError::Storage(StorageError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Payment(_) | AppError::Notification(_) => StatusCode::BAD_GATEWAY,
            AppError::WebhookSignature(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_) | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("request failed status={} error={}", status.as_u16(), self);
        } else {
            log::warn!("request rejected status={} error={}", status.as_u16(), self);
        }

        HttpResponse::build(status)
            .insert_header(ContentType::json())
            .json(json!({ "error": self.public_message() }))
    }
}
