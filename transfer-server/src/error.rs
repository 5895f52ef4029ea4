use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use transfer_engine::TransferError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        let msg = err.to_string();
        match err {
            TransferError::Conflict(_) => AppError::Conflict(msg),
            TransferError::Integrity(_) => AppError::Unprocessable(msg),
            TransferError::Format(_)
            | TransferError::Chunk(_)
            | TransferError::InvalidChunk(_)
            | TransferError::Encoding(_)
            | TransferError::Base64(_) => AppError::BadRequest(msg),
            TransferError::NotFound(_) | TransferError::Cancelled(_) => AppError::NotFound(msg),
            other => AppError::Internal(other.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: TransferError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_transfer_errors_map_to_status_codes() {
        assert_eq!(status_of(TransferError::Conflict("export".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(TransferError::Integrity("checksum".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(TransferError::Chunk("index 9".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(TransferError::Format("no manifest".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(TransferError::Cancelled("gone".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(TransferError::PartialWrite("wp_posts".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
