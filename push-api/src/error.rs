use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use push_core::PushError;

/// `PushError` rendered as `{error, code}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub PushError);

impl From<PushError> for ApiError {
    fn from(err: PushError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PushError::Validation(_) => StatusCode::BAD_REQUEST,
            PushError::Ownership { .. } => StatusCode::FORBIDDEN,
            PushError::NotFound => StatusCode::NOT_FOUND,
            PushError::Conflict => StatusCode::CONFLICT,
            PushError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            PushError::TransientDelivery { .. }
            | PushError::PermanentDelivery { .. }
            | PushError::Storage(_)
            | PushError::Lock(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(PushError::validation("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(PushError::Ownership { user_id: 1 }).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ApiError(PushError::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError(PushError::Conflict).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError(PushError::Storage("down".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
