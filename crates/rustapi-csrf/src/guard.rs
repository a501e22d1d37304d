//! Per-request CSRF decision and token cookie issuance.

use crate::config::CsrfConfig;
use crate::error::{CsrfError, RejectionRenderer};
use crate::exempt::{ExemptionRegistry, RouteInfo};
use crate::referer::check_referer;
use crate::session::SecretStore;
use crate::token::{random_string, CsrfToken, SessionSecret};
use crate::Response;
use cookie::Cookie;
use http::header::{self, HeaderMap, HeaderValue};
use http::request::Parts;
use http::{Extensions, Method, Uri};
use std::sync::Arc;

const SESSION_ID_LENGTH: usize = 32;

/// Request-scoped state handed to pre-check callables.
///
/// Lives for exactly one request; setting the skip flag affects nothing else.
pub struct CsrfContext<'a> {
    parts: &'a Parts,
    secure: bool,
    skip: bool,
}

impl<'a> CsrfContext<'a> {
    pub(crate) fn new(parts: &'a Parts, secure: bool) -> Self {
        Self {
            parts,
            secure,
            skip: false,
        }
    }

    /// Get the HTTP method
    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    /// Get the URI
    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    /// Get the headers
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Get request extensions
    pub fn extensions(&self) -> &Extensions {
        &self.parts.extensions
    }

    /// Route the request is dispatched to, if the host provided it.
    pub fn route(&self) -> Option<&RouteInfo> {
        self.parts.extensions.get::<RouteInfo>()
    }

    /// Whether the request arrived over a secure scheme.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Bypass the CSRF check for this request only.
    pub fn skip_csrf_check(&mut self) {
        self.skip = true;
    }

    /// Whether a pre-check asked to bypass the check.
    pub fn is_skipped(&self) -> bool {
        self.skip
    }
}

/// A callable run before every protected check.
pub type PreCheck = Arc<dyn Fn(&mut CsrfContext<'_>) + Send + Sync>;

/// Marker placed in response extensions to replace the session secret and
/// issue a fresh token, e.g. after login.
#[derive(Debug, Clone, Copy, Default)]
pub struct RotateCsrfToken;

/// Ask the CSRF layer to rotate the token when `response` is sent.
pub fn rotate_token<B>(response: &mut http::Response<B>) {
    response.extensions_mut().insert(RotateCsrfToken);
}

/// Cookies relevant to the guard, read from the request.
#[derive(Debug, Default)]
pub(crate) struct RequestCookies {
    pub(crate) csrf: Option<String>,
    pub(crate) session: Option<String>,
}

/// Session handle resolved lazily against the secret store.
///
/// The id the client sent is only honoured when the store knows it; any
/// other id is replaced by a fresh server-generated one.
pub(crate) struct SessionState {
    claimed: Option<String>,
    resolved: Option<ResolvedSession>,
    is_new: bool,
}

struct ResolvedSession {
    id: String,
    secret: SessionSecret,
}

impl SessionState {
    pub(crate) fn new(claimed: Option<String>) -> Self {
        Self {
            claimed,
            resolved: None,
            is_new: false,
        }
    }

    fn resolve(&mut self, store: &dyn SecretStore) -> &mut ResolvedSession {
        let claimed = &mut self.claimed;
        let is_new = &mut self.is_new;
        self.resolved.get_or_insert_with(|| {
            let known = claimed
                .take()
                .and_then(|id| store.load(&id).map(|secret| ResolvedSession { id, secret }));
            known.unwrap_or_else(|| {
                *is_new = true;
                let id = random_string(SESSION_ID_LENGTH);
                let secret = store.load_or_create(&id);
                ResolvedSession { id, secret }
            })
        })
    }

    /// Secret of this session, starting a new session on first need.
    pub(crate) fn secret(&mut self, store: &dyn SecretStore) -> SessionSecret {
        self.resolve(store).secret.clone()
    }

    /// Whether this request started the session.
    pub(crate) fn is_new(&self) -> bool {
        self.is_new
    }

    /// Id of a session started by this request, once it holds a secret.
    fn issued_id(&self) -> Option<&str> {
        self.resolved
            .as_ref()
            .filter(|_| self.is_new)
            .map(|session| session.id.as_str())
    }

    fn rotate(&mut self, store: &dyn SecretStore) -> SessionSecret {
        let session = self.resolve(store);
        session.secret = store.rotate(&session.id);
        session.secret.clone()
    }
}

/// Token the response carries, and whether it still has to be set.
pub(crate) struct Issued {
    pub(crate) token: CsrfToken,
    pub(crate) set_cookie: bool,
}

/// The frozen guard shared by every clone of the service.
pub(crate) struct Guard {
    pub(crate) config: CsrfConfig,
    pub(crate) exemptions: ExemptionRegistry,
    pub(crate) prechecks: Vec<PreCheck>,
    pub(crate) store: Arc<dyn SecretStore>,
    pub(crate) renderer: RejectionRenderer,
}

impl Guard {
    pub(crate) fn is_secure(&self, parts: &Parts) -> bool {
        if parts.uri.scheme() == Some(&http::uri::Scheme::HTTPS) {
            return true;
        }
        self.config.trust_forwarded_proto
            && parts
                .headers
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
    }

    pub(crate) fn request_cookies(&self, headers: &HeaderMap) -> RequestCookies {
        let mut cookies = RequestCookies::default();
        for value in headers.get_all(header::COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            for c in Cookie::split_parse(value).filter_map(|c| c.ok()) {
                if c.name() == self.config.cookie_name && !c.value().is_empty() {
                    cookies.csrf = Some(c.value().to_string());
                } else if c.name() == self.config.session_cookie_name && !c.value().is_empty() {
                    cookies.session = Some(c.value().to_string());
                }
            }
        }
        cookies
    }

    fn header_token<'p>(&self, parts: &'p Parts) -> Option<&'p str> {
        parts
            .headers
            .get(self.config.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Whether the submitted token has to come from a form body.
    pub(crate) fn wants_form_token(&self, parts: &Parts) -> bool {
        !is_safe_method(&parts.method)
            && self.header_token(parts).is_none()
            && parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
    }

    pub(crate) fn form_token(&self, body: &[u8]) -> Option<String> {
        serde_urlencoded::from_bytes::<Vec<(String, String)>>(body)
            .ok()?
            .into_iter()
            .find(|(name, value)| name == &self.config.form_field && !value.is_empty())
            .map(|(_, value)| value)
    }

    /// Run the protection state machine for a state-changing request.
    pub(crate) fn protect(
        &self,
        parts: &Parts,
        secure: bool,
        cookies: &RequestCookies,
        form_token: Option<&str>,
        session: &mut SessionState,
    ) -> Result<(), CsrfError> {
        if let Some(route) = parts.extensions.get::<RouteInfo>() {
            if self.exemptions.is_exempt(route) {
                tracing::debug!(endpoint = route.endpoint(), "CSRF check exempt");
                return Ok(());
            }
        }

        let mut ctx = CsrfContext::new(parts, secure);
        for precheck in &self.prechecks {
            precheck(&mut ctx);
        }
        if ctx.is_skipped() {
            tracing::debug!(path = parts.uri.path(), "CSRF check skipped");
            return Ok(());
        }

        if secure && self.config.check_referer {
            let referer = parts
                .headers
                .get(header::REFERER)
                .map(|v| v.to_str().unwrap_or_default());
            check_referer(referer, &self.config.allowed_hosts, request_host(parts))?;
        }

        let cookie_token = cookies.csrf.as_deref().ok_or(CsrfError::MissingCookie)?;
        let submitted = self
            .header_token(parts)
            .or(form_token)
            .ok_or(CsrfError::BadToken)?;

        let secret = session.secret(self.store.as_ref());
        let max_age = self.config.token_max_age;
        let expected = CsrfToken::decode(cookie_token, &secret, max_age).ok_or(CsrfError::BadToken)?;
        let actual = CsrfToken::decode(submitted, &secret, max_age).ok_or(CsrfError::BadToken)?;
        if !expected.ct_eq(&actual) {
            return Err(CsrfError::BadToken);
        }
        Ok(())
    }

    /// Decide which token the response carries.
    ///
    /// The request's cookie is kept when it still verifies against the
    /// secret of a known session; otherwise a fresh token is minted.
    pub(crate) fn issue(&self, cookies: &RequestCookies, session: &mut SessionState) -> Issued {
        let secret = session.secret(self.store.as_ref());
        if let Some(existing) = cookies.csrf.as_deref().filter(|_| !session.is_new()) {
            if CsrfToken::decode(existing, &secret, self.config.token_max_age).is_some() {
                return Issued {
                    token: CsrfToken::new(existing.to_string()),
                    set_cookie: false,
                };
            }
            tracing::debug!(cookie = %self.config.cookie_name, "Replacing stale CSRF cookie");
        }
        Issued {
            token: CsrfToken::mint(&secret),
            set_cookie: true,
        }
    }

    /// Replace the session secret and mint a token signed with it.
    pub(crate) fn rotate(&self, session: &mut SessionState) -> Issued {
        let secret = session.rotate(self.store.as_ref());
        Issued {
            token: CsrfToken::mint(&secret),
            set_cookie: true,
        }
    }

    pub(crate) fn reject(&self, err: &CsrfError) -> Response {
        (self.renderer)(err)
    }

    /// Append the CSRF and, for new sessions, session cookies.
    pub(crate) fn write_cookies(
        &self,
        response: &mut Response,
        issued: &Issued,
        session: &SessionState,
        secure: bool,
    ) {
        if issued.set_cookie {
            let mut cookie = Cookie::build((
                self.config.cookie_name.clone(),
                issued.token.as_str().to_owned(),
            ))
            .path(self.config.cookie_path.clone())
            .secure(secure)
            .http_only(false)
            .same_site(self.config.cookie_same_site);

            if let Some(domain) = &self.config.cookie_domain {
                cookie = cookie.domain(domain.clone());
            }
            if let Some(max_age) = self.config.token_max_age {
                cookie = cookie.max_age(cookie::time::Duration::seconds(
                    i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX),
                ));
            }

            append_cookie(response, cookie.build());
            tracing::debug!(cookie = %self.config.cookie_name, "CSRF cookie issued");
        }

        if let Some(id) = session.issued_id() {
            let mut cookie = Cookie::build((self.config.session_cookie_name.clone(), id.to_owned()))
                .path("/")
                .secure(secure)
                .http_only(true)
                .same_site(cookie::SameSite::Lax);
            if let Some(domain) = &self.config.cookie_domain {
                cookie = cookie.domain(domain.clone());
            }
            append_cookie(response, cookie.build());
        }
    }
}

fn append_cookie(response: &mut Response, cookie: Cookie<'static>) {
    match HeaderValue::from_str(&cookie.to_string()) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => tracing::warn!(error = %e, cookie = cookie.name(), "Dropping unencodable cookie"),
    }
}

fn request_host(parts: &Parts) -> Option<&str> {
    parts.uri.authority().map(|a| a.as_str()).or_else(|| {
        parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
    })
}

pub(crate) fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}
