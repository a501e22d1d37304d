//! Error types for CSRF protection
//!
//! Rejections are ordinary values: the guard never panics on a malformed or
//! hostile request, it returns a [`CsrfError`] which the layer renders into a
//! `400 Bad Request` response.

use crate::Response;
use bytes::Bytes;
use http::{header, StatusCode};
use http_body_util::Full;
use serde::Serialize;
use std::sync::Arc;

/// Reason string for a request without a CSRF cookie.
pub const REASON_NO_CSRF_COOKIE: &str = "no csrf cookie";
/// Reason string for a secure request without a Referer header.
pub const REASON_NO_REFERER: &str = "no referer";
/// Reason string for a Referer header that is not an absolute URL.
pub const REASON_MALFORMED_REFERER: &str = "malformed referer";
/// Reason string for a plain-HTTP Referer on a secure request.
pub const REASON_INSECURE_REFERER: &str = "insecure referer";
/// Reason prefix for a Referer host outside the allow-list.
pub const REASON_BAD_REFERER: &str = "bad referer";
/// Reason string for a missing or mismatched submitted token.
pub const REASON_BAD_TOKEN: &str = "bad token";

/// Why a request was rejected by the CSRF guard.
///
/// The `Display` output is the message sent to the client. Cryptographic
/// failures of any kind are reported as [`CsrfError::BadToken`] without
/// further detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CsrfError {
    /// The request carries no CSRF cookie.
    #[error("no csrf cookie")]
    MissingCookie,
    /// Secure request without a Referer header.
    #[error("no referer")]
    NoReferer,
    /// The Referer header could not be parsed as an absolute URL.
    #[error("malformed referer")]
    MalformedReferer,
    /// The Referer uses an insecure scheme while the request is secure.
    #[error("insecure referer")]
    InsecureReferer,
    /// The Referer host is not allowed. Carries the offending header value.
    #[error("bad referer: {0}")]
    BadReferer(String),
    /// The submitted token is absent, invalid, or does not match the cookie.
    #[error("bad token")]
    BadToken,
}

impl CsrfError {
    /// HTTP status code used for every rejection.
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    /// Render the default JSON rejection response.
    ///
    /// ```json
    /// {"status": 400, "message": "bad token"}
    /// ```
    pub fn into_response(self) -> Response {
        render_json(&self)
    }
}

/// A sink turning a rejection into a response.
pub type RejectionRenderer = Arc<dyn Fn(&CsrfError) -> Response + Send + Sync>;

#[derive(Serialize)]
struct RejectionBody<'a> {
    status: u16,
    message: &'a str,
}

pub(crate) fn render_json(err: &CsrfError) -> Response {
    let status = err.status();
    let message = err.to_string();
    let body = serde_json::to_vec(&RejectionBody {
        status: status.as_u16(),
        message: &message,
    })
    .unwrap_or_default();

    let mut response = http::Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Setup-time configuration failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable deserialization failed.
    #[error("configuration error: {0}")]
    Env(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A setting has a value the layer cannot use.
    #[error("invalid value for {field}: {value}")]
    Invalid {
        /// The offending setting.
        field: &'static str,
        /// The value that was rejected.
        value: String,
    },
}
