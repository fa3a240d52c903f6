use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::{Error, ErrorKind};

/// Handler error. Maps the error taxonomy onto the responder's status codes.
pub struct AppError(Error);

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::ProtocolViolation | ErrorKind::CryptoIntegrity => StatusCode::BAD_REQUEST,
            ErrorKind::SessionExpired => StatusCode::NOT_FOUND,
            ErrorKind::HandshakeTransport
            | ErrorKind::AttestationInvalid
            | ErrorKind::PolicyRejected => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }
        (status, status.as_str().to_owned()).into_response()
    }
}
