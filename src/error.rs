//! Error kinds surfaced to HTTP clients.
//!
//! Every subprocess and upstream failure is converted into one of these
//! variants at the handler boundary. The message is what the client sees, so
//! it never carries raw extractor output or upstream bodies; those go to the
//! log instead.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// A required parameter was missing or unusable. Nothing was spawned.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// The extractor exited without producing any output.
    #[error("{0}")]
    ExtractionFailed(String),

    #[error("{0}")]
    Internal(String),

    /// A proxied third-party API was unreachable or answered with a non-2xx
    /// status.
    #[error("{0}")]
    UpstreamUnavailable(String),

    /// The extractor or an upstream API exceeded its wall-clock bound.
    #[error("{0}")]
    UpstreamTimeout(String),
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ExtractionFailed(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.to_string(),
        });
        (self.status(), headers, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
