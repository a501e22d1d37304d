use crate::error::ConfigError;
use cookie::SameSite;
use std::collections::HashSet;
use std::time::Duration;

/// Name of the CSRF cookie. Default for [`CsrfConfig::cookie_name`].
pub const CSRF_COOKIE_NAME: &str = "csrftoken";
/// Header carrying the submitted token. Default for [`CsrfConfig::header_name`].
pub const CSRF_HEADER_NAME: &str = "X-CSRF-Token";
/// Name of the session id cookie.
pub const SESSION_COOKIE_NAME: &str = "session";

/// Configuration for CSRF protection.
#[derive(Clone, Debug)]
pub struct CsrfConfig {
    /// Master switch. When false no cookie is set and no request is checked.
    /// Default: true
    pub csrf_enabled: bool,

    /// Hosts accepted in the Referer of secure requests, as `host` or
    /// `host:port`. A leading dot matches the domain and its subdomains.
    /// When empty, only the request's own host is accepted.
    /// Default: empty
    pub allowed_hosts: HashSet<String>,

    /// The name of the cookie used to store the CSRF token.
    /// Default: "csrftoken"
    pub cookie_name: String,

    /// The name of the header expected to contain the CSRF token.
    /// Default: "X-CSRF-Token"
    pub header_name: String,

    /// Form field read when the header is absent. Follows
    /// [`CsrfConfig::header_name`] until set to a different name.
    /// Default: "X-CSRF-Token"
    pub form_field: String,

    /// The path for the CSRF cookie.
    /// Default: "/"
    pub cookie_path: String,

    /// The domain for the CSRF cookie.
    /// Default: None
    pub cookie_domain: Option<String>,

    /// The SameSite attribute for the CSRF cookie.
    /// Default: Strict
    pub cookie_same_site: SameSite,

    /// Maximum token age; also used as the cookie `Max-Age`.
    /// Default: 7 days
    pub token_max_age: Option<Duration>,

    /// Validate the Referer of secure requests.
    /// Default: true
    pub check_referer: bool,

    /// Treat `X-Forwarded-Proto: https` as a secure request. Only enable
    /// behind a proxy that sets this header.
    /// Default: false
    pub trust_forwarded_proto: bool,

    /// The name of the `HttpOnly` cookie identifying the session.
    /// Default: "session"
    pub session_cookie_name: String,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            csrf_enabled: true,
            allowed_hosts: HashSet::new(),
            cookie_name: CSRF_COOKIE_NAME.to_string(),
            header_name: CSRF_HEADER_NAME.to_string(),
            form_field: CSRF_HEADER_NAME.to_string(),
            cookie_path: "/".to_string(),
            cookie_domain: None,
            cookie_same_site: SameSite::Strict,
            token_max_age: Some(Duration::from_secs(60 * 60 * 24 * 7)),
            check_referer: true,
            trust_forwarded_proto: false,
            session_cookie_name: SESSION_COOKIE_NAME.to_string(),
        }
    }
}

impl CsrfConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable protection altogether.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.csrf_enabled = enabled;
        self
    }

    /// Add a host to the Referer allow-list.
    pub fn allowed_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into().to_ascii_lowercase());
        self
    }

    /// Add several hosts to the Referer allow-list.
    pub fn allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts
            .extend(hosts.into_iter().map(|h| h.into().to_ascii_lowercase()));
        self
    }

    /// Set the cookie name.
    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// Set the header name. The form field is renamed along with it unless
    /// it was set to a different name.
    pub fn header_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if self.form_field == self.header_name {
            self.form_field = name.clone();
        }
        self.header_name = name;
        self
    }

    /// Set the form field name.
    pub fn form_field(mut self, name: impl Into<String>) -> Self {
        self.form_field = name.into();
        self
    }

    /// Set the cookie path.
    pub fn cookie_path(mut self, path: impl Into<String>) -> Self {
        self.cookie_path = path.into();
        self
    }

    /// Set the cookie domain.
    pub fn cookie_domain(mut self, domain: impl Into<String>) -> Self {
        self.cookie_domain = Some(domain.into());
        self
    }

    /// Set the SameSite attribute.
    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.cookie_same_site = same_site;
        self
    }

    /// Set the maximum token age. `None` disables expiry.
    pub fn token_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.token_max_age = max_age;
        self
    }

    /// Enable or disable Referer checking on secure requests.
    pub fn check_referer(mut self, check: bool) -> Self {
        self.check_referer = check;
        self
    }

    /// Trust `X-Forwarded-Proto` when deciding whether a request is secure.
    pub fn trust_forwarded_proto(mut self, trust: bool) -> Self {
        self.trust_forwarded_proto = trust;
        self
    }

    /// Set the session cookie name.
    pub fn session_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.session_cookie_name = name.into();
        self
    }

    /// Check the settings that would otherwise fail on every request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if http::HeaderName::from_bytes(self.header_name.as_bytes()).is_err() {
            return Err(ConfigError::Invalid {
                field: "header_name",
                value: self.header_name.clone(),
            });
        }
        for (field, value) in [
            ("cookie_name", &self.cookie_name),
            ("session_cookie_name", &self.session_cookie_name),
        ] {
            if value.is_empty() || value.contains([';', '=', ',', ' ']) {
                return Err(ConfigError::Invalid {
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.cookie_name == self.session_cookie_name {
            return Err(ConfigError::Invalid {
                field: "session_cookie_name",
                value: self.session_cookie_name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(feature = "config")]
mod env {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct EnvConfig {
        enabled: Option<bool>,
        allowed_hosts: Option<String>,
        cookie_name: Option<String>,
        header_name: Option<String>,
        cookie_domain: Option<String>,
        cookie_samesite: Option<String>,
        token_max_age: Option<u64>,
        check_referer: Option<bool>,
        trust_forwarded_proto: Option<bool>,
    }

    fn parse_same_site(value: &str) -> Result<SameSite, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            _ => Err(ConfigError::Invalid {
                field: "cookie_samesite",
                value: value.to_string(),
            }),
        }
    }

    impl CsrfConfig {
        /// Load configuration from `CSRF_*` environment variables.
        ///
        /// A `.env` file in the working directory is read first if present.
        /// Unset variables keep their defaults. `CSRF_ALLOWED_HOSTS` is a
        /// comma separated list and `CSRF_TOKEN_MAX_AGE` is in seconds
        /// (`0` disables expiry).
        ///
        /// # Example
        ///
        /// ```ignore
        /// use rustapi_csrf::CsrfConfig;
        ///
        /// // CSRF_ALLOWED_HOSTS=example.com,.example.org
        /// let config = CsrfConfig::from_env().expect("invalid CSRF configuration");
        /// ```
        pub fn from_env() -> Result<Self, ConfigError> {
            let _ = dotenvy::dotenv();
            let vars = envy::prefixed("CSRF_")
                .from_env::<EnvConfig>()
                .map_err(|e| ConfigError::Env(Box::new(e)))?;

            let mut config = Self::default();
            if let Some(enabled) = vars.enabled {
                config.csrf_enabled = enabled;
            }
            if let Some(hosts) = vars.allowed_hosts {
                config = config.allowed_hosts(
                    hosts
                        .split(',')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(str::to_string),
                );
            }
            if let Some(name) = vars.cookie_name {
                config.cookie_name = name;
            }
            if let Some(name) = vars.header_name {
                config = config.header_name(name);
            }
            config.cookie_domain = vars.cookie_domain.or(config.cookie_domain);
            if let Some(same_site) = vars.cookie_samesite {
                config.cookie_same_site = parse_same_site(&same_site)?;
            }
            if let Some(secs) = vars.token_max_age {
                config.token_max_age = (secs > 0).then(|| Duration::from_secs(secs));
            }
            if let Some(check) = vars.check_referer {
                config.check_referer = check;
            }
            if let Some(trust) = vars.trust_forwarded_proto {
                config.trust_forwarded_proto = trust;
            }

            config.validate()?;
            Ok(config)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CsrfConfig::new();
        assert!(config.csrf_enabled);
        assert!(config.allowed_hosts.is_empty());
        assert_eq!(config.cookie_name, "csrftoken");
        assert_eq!(config.header_name, "X-CSRF-Token");
        assert_eq!(config.form_field, "X-CSRF-Token");
        assert_eq!(config.cookie_same_site, SameSite::Strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_allowed_hosts_are_lowercased() {
        let config = CsrfConfig::new()
            .allowed_host("Example.COM")
            .allowed_hosts(["api.example.com:8443"]);
        assert!(config.allowed_hosts.contains("example.com"));
        assert!(config.allowed_hosts.contains("api.example.com:8443"));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(CsrfConfig::new().header_name("bad header").validate().is_err());
        assert!(CsrfConfig::new().cookie_name("a;b").validate().is_err());
        assert!(CsrfConfig::new().cookie_name("session").validate().is_err());
    }

    #[test]
    fn test_form_field_follows_header_name() {
        let config = CsrfConfig::new().header_name("X-XSRF-Token");
        assert_eq!(config.form_field, "X-XSRF-Token");

        let config = CsrfConfig::new()
            .form_field("csrf_token")
            .header_name("X-XSRF-Token");
        assert_eq!(config.form_field, "csrf_token");

        let config = CsrfConfig::new()
            .header_name("X-XSRF-Token")
            .form_field("csrf_token");
        assert_eq!(config.form_field, "csrf_token");
    }
}
