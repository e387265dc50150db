use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors returned by sidecar handlers, rendered as plain-text responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid key")]
    InvalidKey,

    #[error("No such key in cache")]
    CacheMiss,

    #[error("{0}")]
    BadRequest(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidKey | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::CacheMiss => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Upstream(e) = &self {
            tracing::warn!("upstream request failed: {}", e);
        }
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::InvalidKey.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::CacheMiss.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::CacheMiss.to_string(), "No such key in cache");
    }
}
