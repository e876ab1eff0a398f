//! Response mapping for flow results and errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use serde_json::json;

use crate::error::AuthError;
use crate::outcome::{Outcome, PageKind};
use crate::resume::ResumeError;

// ============================================================================
// IntoResponse Implementations
// ============================================================================

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Self::Redirect(url) => Redirect::to(url.as_str()).into_response(),
            Self::Page(page) => {
                let status = match page.kind {
                    PageKind::Error => StatusCode::BAD_REQUEST,
                    PageKind::Info | PageKind::Challenge => StatusCode::OK,
                };
                (status, Json(page)).into_response()
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = self.user_message();
        error_response(&self, message)
    }
}

impl IntoResponse for ResumeError {
    fn into_response(self) -> Response {
        error_response(&self.error, self.message)
    }
}

fn error_response(error: &AuthError, message: String) -> Response {
    let status = status_for(error);
    if status.is_server_error() {
        tracing::error!(error = %error, "Auth flow request failed");
    } else {
        tracing::debug!(error = %error, code = error.error_code(), "Auth flow request rejected");
    }

    let body = json!({
        "error": error.error_code(),
        "error_description": message,
    });
    (status, Json(body)).into_response()
}

/// Maps an error to its HTTP status.
fn status_for(error: &AuthError) -> StatusCode {
    match error {
        AuthError::RealmDisabled | AuthError::TlsRequired | AuthError::NotAllowed { .. } => {
            StatusCode::FORBIDDEN
        }
        AuthError::IdentityProvider { .. } => StatusCode::BAD_GATEWAY,
        e if e.is_server_error() => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}
