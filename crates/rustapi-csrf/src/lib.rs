//! # rustapi-csrf
//!
//! CSRF protection for RustAPI and any `tower` HTTP service, using the
//! Double-Submit Cookie pattern with signed tokens.
//!
//! - Every response carries a `csrftoken` cookie holding a token signed with
//!   a per-session secret. The cookie is readable by scripts so clients can
//!   echo it back.
//! - State-changing requests (`POST`, `PUT`, `PATCH`, `DELETE`, ...) must
//!   send the same token in the `X-CSRF-Token` header, or as a form field.
//! - Requests over HTTPS must also carry a same-origin `Referer`.
//! - Endpoints and route groups can be exempted, and pre-check callables can
//!   skip the check for a single request.
//!
//! Rejected requests never reach the inner service; they get a
//! `400 Bad Request` with a JSON body such as
//! `{"status": 400, "message": "bad token"}`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rustapi_csrf::{CsrfConfig, CsrfProtect, Request, Response};
//! use std::convert::Infallible;
//! use tower::{service_fn, Layer};
//!
//! async fn handler(_req: Request) -> Result<Response, Infallible> {
//!     Ok(Response::new("ok".into()))
//! }
//!
//! let mut csrf = CsrfProtect::with_config(
//!     CsrfConfig::new()
//!         .allowed_host("example.com")
//!         .cookie_name("my-csrf-cookie"),
//! );
//! csrf.exempt("webhooks.github");
//!
//! let service = csrf.into_layer()?.layer(service_fn(handler));
//! # let _ = service;
//! # Ok::<(), rustapi_csrf::ConfigError>(())
//! ```
//!
//! Invalid settings, such as a header name that is not a valid HTTP header,
//! are reported by `into_layer` and `attach` instead of failing every request
//! later on.
//!
//! ## Features
//!
//! - `config` (default) - `CsrfConfig::from_env()` with `.env` file support

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod config;
mod error;
mod exempt;
mod guard;
mod layer;
mod referer;
mod session;
mod token;

use bytes::Bytes;
use http_body_util::Full;

/// Request type handled by the CSRF service.
pub type Request = http::Request<Full<Bytes>>;

/// Response type produced by the CSRF service.
pub type Response = http::Response<Full<Bytes>>;

pub use config::{CsrfConfig, CSRF_COOKIE_NAME, CSRF_HEADER_NAME, SESSION_COOKIE_NAME};
pub use error::{
    ConfigError, CsrfError, RejectionRenderer, REASON_BAD_REFERER, REASON_BAD_TOKEN,
    REASON_INSECURE_REFERER, REASON_MALFORMED_REFERER, REASON_NO_CSRF_COOKIE, REASON_NO_REFERER,
};
pub use exempt::{ExemptTarget, Exemptable, ExemptionRegistry, RouteGroup, RouteInfo};
pub use guard::{rotate_token, CsrfContext, PreCheck, RotateCsrfToken};
pub use layer::{CsrfLayer, CsrfProtect, CsrfService};
pub use referer::check_referer;
pub use session::{MemorySecretStore, SecretStore};
pub use token::{CsrfToken, SessionSecret, TokenValue, SECRET_LENGTH};
