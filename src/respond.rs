//! Canned responses: JSON error envelopes and the root redirect.
//!
//! The envelope bodies are deliberately small and machine-readable; the 500
//! envelope carries no internal error detail.

use serde_json::json;

use crate::http::{Response, StatusCode};

/// `400 Bad Request` with a `{error, path}` JSON envelope.
pub(crate) fn bad_request(path: &str) -> Response {
    Response::new(StatusCode::BadRequest).json(&json!({
        "error": "400 Bad Request",
        "path": path,
    }))
}

/// `404 Not Found` with a `{error, path}` JSON envelope.
pub(crate) fn not_found(path: &str) -> Response {
    Response::new(StatusCode::NotFound).json(&json!({
        "error": "404 Not Found",
        "path": path,
    }))
}

/// `500 Server Error` with a generic `{error}` JSON envelope.
pub(crate) fn server_error() -> Response {
    Response::new(StatusCode::InternalServerError).json(&json!({
        "error": "500 Server Error",
    }))
}

/// `302 Found` redirect to `location`.
pub(crate) fn redirect(location: &str) -> Response {
    Response::new(StatusCode::Found).header("Location", location)
}
