use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::UserId;
use courier_store::StoreError;

/// Server-side error taxonomy.
///
/// Participation checks fail closed (`AccessDenied`); creation races resolve
/// below this layer and never surface as `Conflict` in practice; transient
/// delivery failures are absorbed by the broadcaster and never reach here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The intended recipient has blocked the sender.
    #[error("Recipient has blocked the sender")]
    Blocked { user_id: UserId },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::AccessDenied(_) | ServerError::Blocked { .. } => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Store(StoreError::NotFound) => {
                (StatusCode::NOT_FOUND, "Record not found".to_string())
            }
            ServerError::Store(_) | ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_404() {
        let response = ServerError::Store(StoreError::NotFound).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn access_denied_maps_to_403() {
        let response = ServerError::AccessDenied("not a participant".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
