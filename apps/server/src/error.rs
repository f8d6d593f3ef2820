use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use barvault_core::bars::Gap;
use barvault_core::Error;
use serde::Serialize;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] Error),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    gaps: Option<Vec<Gap>>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(e) if e.is_precondition() => StatusCode::BAD_REQUEST,
            ApiError::Core(Error::IncompleteData { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Core(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let message = self.to_string();
        let gaps = match self {
            ApiError::Core(Error::IncompleteData { gaps }) => Some(gaps),
            _ => None,
        };
        let body = ErrorBody {
            code: status.as_u16(),
            message,
            gaps,
        };
        (status, Json(body)).into_response()
    }
}
