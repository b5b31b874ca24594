//! Maps `common::Error` onto the uniform JSON envelope spec.md §4.9
//! requires: `{status: "error", errorType, error}` with the HTTP status
//! code chosen per error kind, mirroring `ApiError`/`apiFuncWrap` in the
//! original's `api.go`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::error::Error;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    status: &'static str,
    error_type: &'static str,
    error: String,
}

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

fn error_type(e: &Error) -> (&'static str, StatusCode) {
    match e {
        Error::BadRequest(_) => ("bad_data", StatusCode::BAD_REQUEST),
        Error::NotFound(_) => ("not_found", StatusCode::NOT_FOUND),
        Error::Cancelled => ("canceled", StatusCode::SERVICE_UNAVAILABLE),
        Error::ResourceExhausted(_) => ("resource_exhausted", StatusCode::INSUFFICIENT_STORAGE),
        Error::StorageRead(_) | Error::StorageWrite(_) => ("internal", StatusCode::INTERNAL_SERVER_ERROR),
        Error::MalformedKey(_) | Error::MalformedValue(_) => ("internal", StatusCode::INTERNAL_SERVER_ERROR),
        Error::Internal(_) => ("internal", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (typ, status) = error_type(&self.0);
        let body = ErrorEnvelope {
            status: "error",
            error_type: typ,
            error: self.0.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}
