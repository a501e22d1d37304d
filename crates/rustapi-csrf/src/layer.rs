use crate::config::CsrfConfig;
use crate::error::{render_json, ConfigError, CsrfError, RejectionRenderer};
use crate::exempt::{ExemptTarget, Exemptable, ExemptionRegistry};
use crate::guard::{is_safe_method, CsrfContext, Guard, PreCheck, RotateCsrfToken, SessionState};
use crate::session::{MemorySecretStore, SecretStore};
use crate::{Request, Response};
use http_body_util::{BodyExt, Full};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Builder for CSRF protection.
///
/// Holds configuration and registrations until it is bound to a service with
/// [`CsrfProtect::attach`] or [`CsrfProtect::into_layer`]. Registration
/// methods return their argument so they can wrap a definition in place.
///
/// ```rust,no_run
/// use rustapi_csrf::{CsrfConfig, CsrfContext, CsrfProtect, RouteGroup};
///
/// let mut csrf = CsrfProtect::with_config(CsrfConfig::new().allowed_host("example.com"));
///
/// let webhooks = csrf.exempt(RouteGroup::new("webhooks"));
/// csrf.exempt("health.ping");
/// csrf.before_csrf_protect(|ctx: &mut CsrfContext<'_>| {
///     if ctx.headers().contains_key("authorization") {
///         ctx.skip_csrf_check();
///     }
/// });
///
/// let layer = csrf.into_layer()?;
/// # let _ = (webhooks, layer);
/// # Ok::<(), rustapi_csrf::ConfigError>(())
/// ```
pub struct CsrfProtect {
    config: CsrfConfig,
    exemptions: ExemptionRegistry,
    prechecks: Vec<PreCheck>,
    store: Option<Arc<dyn SecretStore>>,
    renderer: RejectionRenderer,
}

impl CsrfProtect {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::with_config(CsrfConfig::default())
    }

    /// Create a builder with the given configuration.
    pub fn with_config(config: CsrfConfig) -> Self {
        Self {
            config,
            exemptions: ExemptionRegistry::new(),
            prechecks: Vec::new(),
            store: None,
            renderer: Arc::new(render_json),
        }
    }

    /// Replace the configuration.
    pub fn config(mut self, config: CsrfConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom session secret backend.
    ///
    /// Defaults to a [`MemorySecretStore`] forgetting sessions idle for
    /// longer than the token max age.
    pub fn secret_store<S: SecretStore>(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Use a custom response for rejected requests.
    pub fn on_reject<F>(mut self, renderer: F) -> Self
    where
        F: Fn(&CsrfError) -> Response + Send + Sync + 'static,
    {
        self.renderer = Arc::new(renderer);
        self
    }

    /// Current configuration.
    pub fn csrf_config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Register a callable run before every protected check.
    ///
    /// Callables run in registration order; registering the same callable
    /// twice runs it twice.
    pub fn before_csrf_protect<F>(&mut self, f: F) -> F
    where
        F: Fn(&mut CsrfContext<'_>) + Clone + Send + Sync + 'static,
    {
        self.prechecks.push(Arc::new(f.clone()));
        f
    }

    /// Number of registered pre-check callables.
    pub fn before_protect_count(&self) -> usize {
        self.prechecks.len()
    }

    /// Exempt an endpoint name or a [`crate::RouteGroup`].
    pub fn exempt<T: Exemptable>(&mut self, target: T) -> T {
        self.exemptions.register(target.exempt_target());
        target
    }

    /// Exempt a handler value. Hosts identify its route with
    /// [`crate::RouteInfo::for_handler`].
    pub fn exempt_handler<F>(&mut self, handler: F) -> F {
        self.exemptions
            .register(ExemptTarget::Endpoint(std::any::type_name::<F>().to_string()));
        handler
    }

    /// Registered exemptions.
    pub fn exemptions(&self) -> &ExemptionRegistry {
        &self.exemptions
    }

    fn freeze(self) -> Result<Arc<Guard>, ConfigError> {
        self.config.validate()?;
        let store = self.store.unwrap_or_else(|| {
            let store = match self.config.token_max_age {
                Some(ttl) => MemorySecretStore::with_ttl(ttl),
                None => MemorySecretStore::new(),
            };
            Arc::new(store)
        });
        Ok(Arc::new(Guard {
            config: self.config,
            exemptions: self.exemptions,
            prechecks: self.prechecks,
            store,
            renderer: self.renderer,
        }))
    }

    /// Validate the configuration and build the layer. Registrations are
    /// frozen at this point.
    pub fn into_layer(self) -> Result<CsrfLayer, ConfigError> {
        Ok(CsrfLayer {
            guard: self.freeze()?,
        })
    }

    /// Validate the configuration and bind protection to `inner`.
    pub fn attach<S>(self, inner: S) -> Result<CsrfService<S>, ConfigError> {
        Ok(CsrfService {
            inner,
            guard: self.freeze()?,
        })
    }
}

impl Default for CsrfProtect {
    fn default() -> Self {
        Self::new()
    }
}

/// Layer applying CSRF protection using the Double-Submit Cookie pattern.
#[derive(Clone)]
pub struct CsrfLayer {
    guard: Arc<Guard>,
}

impl CsrfLayer {
    /// Create a layer with no exemptions or pre-checks.
    pub fn new(config: CsrfConfig) -> Result<Self, ConfigError> {
        CsrfProtect::with_config(config).into_layer()
    }
}

impl<S> Layer<S> for CsrfLayer {
    type Service = CsrfService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CsrfService {
            inner,
            guard: self.guard.clone(),
        }
    }
}

/// Service produced by [`CsrfLayer`].
#[derive(Clone)]
pub struct CsrfService<S> {
    inner: S,
    guard: Arc<Guard>,
}

impl<S> CsrfService<S> {
    /// Whether protection is active.
    pub fn is_enabled(&self) -> bool {
        self.guard.config.csrf_enabled
    }

    /// The wrapped service.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> Service<Request> for CsrfService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let guard = self.guard.clone();
        // keep the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if !guard.config.csrf_enabled {
                return inner.call(req).await;
            }

            let (parts, body) = req.into_parts();
            let secure = guard.is_secure(&parts);
            let cookies = guard.request_cookies(&parts.headers);
            let mut session = SessionState::new(cookies.session.clone());

            let (body, form_token) = if guard.wants_form_token(&parts) {
                let bytes = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(never) => match never {},
                };
                let token = guard.form_token(&bytes);
                (Full::new(bytes), token)
            } else {
                (body, None)
            };

            let verdict = if is_safe_method(&parts.method) {
                Ok(())
            } else {
                guard.protect(&parts, secure, &cookies, form_token.as_deref(), &mut session)
            };

            let mut issued = guard.issue(&cookies, &mut session);

            let mut response = match verdict {
                Ok(()) => {
                    let mut req = Request::from_parts(parts, body);
                    req.extensions_mut().insert(issued.token.clone());
                    inner.call(req).await?
                }
                Err(err) => {
                    tracing::warn!(
                        method = %parts.method,
                        path = parts.uri.path(),
                        reason = %err,
                        "CSRF check failed"
                    );
                    guard.reject(&err)
                }
            };

            if response.extensions_mut().remove::<RotateCsrfToken>().is_some() {
                issued = guard.rotate(&mut session);
            }
            guard.write_cookies(&mut response, &issued, &session, secure);

            Ok(response)
        })
    }
}
