//! Referer validation for secure requests.

use crate::error::CsrfError;
use std::collections::HashSet;
use url::Url;

/// Validate the Referer header of a secure request.
///
/// `allowed_hosts` entries are lowercase `host` or `host:port` strings; an
/// entry starting with `.` also matches subdomains. When the set is empty,
/// `request_host` is the only accepted host.
pub fn check_referer(
    referer: Option<&str>,
    allowed_hosts: &HashSet<String>,
    request_host: Option<&str>,
) -> Result<(), CsrfError> {
    let raw = referer.ok_or(CsrfError::NoReferer)?;

    let url = Url::parse(raw).map_err(|_| CsrfError::MalformedReferer)?;
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host.to_ascii_lowercase(),
        _ => return Err(CsrfError::MalformedReferer),
    };

    if url.scheme() != "https" {
        return Err(CsrfError::InsecureReferer);
    }

    let with_port = url.port().map(|port| format!("{}:{}", host, port));
    let matches = |pattern: &str| {
        host_matches(pattern, &host) || with_port.as_deref().is_some_and(|hp| host_matches(pattern, hp))
    };

    let allowed = if allowed_hosts.is_empty() {
        request_host
            .map(|h| h.to_ascii_lowercase())
            .is_some_and(|h| matches(&h))
    } else {
        allowed_hosts.iter().any(|pattern| matches(pattern))
    };

    if allowed {
        Ok(())
    } else {
        Err(CsrfError::BadReferer(raw.to_string()))
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix('.') {
        Some(domain) => host == domain || host.ends_with(pattern),
        None => host == pattern,
    }
}
