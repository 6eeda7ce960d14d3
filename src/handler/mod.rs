//! HTTP building blocks shared by the discovery routes.
//!
//! All responses the server produces are JSON: cache hits serve the stored
//! bytes verbatim, everything else is a small `{"code":…,"message":…}`
//! envelope.

pub mod certificate;
pub mod openidmeta;
pub mod workloadidentity;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::store::Store;

const CACHE_CONTROL_PUBLIC: &str = "public, max-age=3600";
const HSTS_VALUE: &str = "max-age=31536000; includeSubDomains";

fn envelope(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"code": status.as_u16(), "message": message})),
    )
        .into_response()
}

/// Terminal handler answering the canonical not found envelope.
pub async fn not_found() -> Response {
    envelope(StatusCode::NOT_FOUND, "not found")
}

/// Fallback for content routes hit with a method other than GET or HEAD.
pub async fn method_not_allowed() -> Response {
    envelope(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

/// Middleware setting `Strict-Transport-Security` unless already present.
pub async fn hsts(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if !headers.contains_key(header::STRICT_TRANSPORT_SECURITY) {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS_VALUE),
        );
    }
    response
}

/// Successful content response: stored bytes verbatim, JSON content type
/// and a public cache control header.
pub(crate) fn content_response(body: Vec<u8>) -> Response {
    (
        [
            (header::CACHE_CONTROL, CACHE_CONTROL_PUBLIC),
            (header::CONTENT_TYPE, "application/json"),
        ],
        Body::from(body),
    )
        .into_response()
}

/// Looks up `projectName--shootUID` in the store and serves the byte slice
/// selected by `content`.
///
/// A `shootUID` that is not a UUID yields the bad request envelope; a
/// missing entry yields the not found envelope.
pub(crate) fn store_response<T, F>(
    store: &Store<T>,
    project_name: &str,
    shoot_uid: &str,
    content: F,
) -> Response
where
    T: Clone,
    F: FnOnce(T) -> Vec<u8>,
{
    if Uuid::parse_str(shoot_uid).is_err() {
        return envelope(StatusCode::BAD_REQUEST, "invalid UID");
    }

    match store.read(&format!("{project_name}--{shoot_uid}")) {
        None => envelope(StatusCode::NOT_FOUND, "not found"),
        Some(data) => content_response(content(data)),
    }
}
