/// Translation of internal errors into HTTP responses.
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

use fetchgate_shared::errors::{AssemblyError, ProbeError, ProxyError, RangeError};

/// Error response body.
#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Handler error. Every route returns this so status mapping lives in one place.
#[derive(Debug)]
pub struct ApiError(pub ProxyError);

impl<E> From<E> for ApiError
where
    E: Into<ProxyError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(ProxyError::BadRequest(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Assembly(e) => match e {
                AssemblyError::InvalidTransferId(_)
                | AssemblyError::InvalidFilename(_)
                | AssemblyError::InvalidIndex { .. } => StatusCode::BAD_REQUEST,
                AssemblyError::UnknownTransfer(_) => StatusCode::NOT_FOUND,
                AssemblyError::MissingChunk(_) | AssemblyError::TotalMismatch { .. } => {
                    StatusCode::CONFLICT
                }
                AssemblyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ProxyError::Range(e) => match e {
                RangeError::NotFound(_) => StatusCode::NOT_FOUND,
                RangeError::NotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
                RangeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ProxyError::Probe(ProbeError::NoUpstreamAvailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Probe(ProbeError::Cancelled) | ProxyError::DeadlineExceeded(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::Fetch(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Config(_) | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status.as_u16(), self.0);
        } else {
            warn!("Request rejected ({}): {}", status.as_u16(), self.0);
        }

        let mut response = (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response();

        if let ProxyError::Range(RangeError::NotSatisfiable { file_size }) = self.0 {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", file_size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}
