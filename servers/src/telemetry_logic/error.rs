use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lib_common::connections::StoreError;
use serde_json::json;
use thiserror::Error;

/// Everything a handler can fail with, rendered as `{"detail": ...}`.
///
/// Signature failures all collapse into `Unauthorized`; the specific
/// reason is logged where it happened and never sent back.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid token")]
    InvalidToken,
    #[error("authentication failed")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidToken | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = match &self {
            Self::Store(e) => {
                tracing::error!("storage failure: {}", e);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::InvalidToken.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Validation("limit".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        let store = ApiError::from(StoreError::Corrupt {
            id: 1,
            reason: "bad ts".into(),
        });
        assert_eq!(store.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_store_details_are_not_exposed() {
        let response = ApiError::from(StoreError::Corrupt {
            id: 1,
            reason: "secret detail".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({"detail": "internal error"}));
    }
}
