//! Routes and route groups that bypass CSRF enforcement.

use std::collections::HashSet;

/// Identity of the route a request is dispatched to.
///
/// The host router inserts this into the request extensions before the CSRF
/// layer runs. Requests without it can only match nothing, so they are always
/// checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    endpoint: String,
    group: Option<String>,
}

impl RouteInfo {
    /// Route identified by an endpoint name.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            group: None,
        }
    }

    /// Route identified by its handler value.
    ///
    /// Uses the same key as [`crate::CsrfProtect::exempt_handler`].
    pub fn for_handler<F>(_handler: &F) -> Self {
        Self::new(std::any::type_name::<F>())
    }

    /// Attach the route group the endpoint was registered under.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Endpoint name.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Route group name, if any.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }
}

/// Handle to a group of routes sharing a prefix or module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteGroup {
    name: String,
}

impl RouteGroup {
    /// Create a group handle.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// [`RouteInfo`] for an endpoint of this group.
    pub fn route(&self, endpoint: impl Into<String>) -> RouteInfo {
        RouteInfo::new(endpoint).in_group(self.name.clone())
    }
}

/// What an exemption applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExemptTarget {
    /// A single endpoint.
    Endpoint(String),
    /// Every endpoint of a route group.
    Group(String),
}

/// Values that can be marked exempt.
pub trait Exemptable {
    /// The registry key for this value.
    fn exempt_target(&self) -> ExemptTarget;
}

impl Exemptable for &str {
    fn exempt_target(&self) -> ExemptTarget {
        ExemptTarget::Endpoint((*self).to_string())
    }
}

impl Exemptable for String {
    fn exempt_target(&self) -> ExemptTarget {
        ExemptTarget::Endpoint(self.clone())
    }
}

impl Exemptable for RouteGroup {
    fn exempt_target(&self) -> ExemptTarget {
        ExemptTarget::Group(self.name.clone())
    }
}

impl Exemptable for &RouteGroup {
    fn exempt_target(&self) -> ExemptTarget {
        ExemptTarget::Group(self.name.clone())
    }
}

impl Exemptable for ExemptTarget {
    fn exempt_target(&self) -> ExemptTarget {
        self.clone()
    }
}

/// Set of exempt endpoints and groups.
#[derive(Debug, Clone, Default)]
pub struct ExemptionRegistry {
    targets: HashSet<ExemptTarget>,
}

impl ExemptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a target exempt. Registering twice has no further effect.
    pub fn register(&mut self, target: ExemptTarget) {
        self.targets.insert(target);
    }

    /// Whether requests to `route` bypass the check.
    pub fn is_exempt(&self, route: &RouteInfo) -> bool {
        if self.targets.is_empty() {
            return false;
        }
        if self
            .targets
            .contains(&ExemptTarget::Endpoint(route.endpoint.clone()))
        {
            return true;
        }
        route
            .group
            .as_ref()
            .is_some_and(|g| self.targets.contains(&ExemptTarget::Group(g.clone())))
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether nothing is exempt.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_view() {}

    fn key_of<F>(_: &F) -> String {
        std::any::type_name::<F>().to_string()
    }

    #[test]
    fn test_endpoint_exemption() {
        let mut registry = ExemptionRegistry::new();
        registry.register("views.csrf_test".exempt_target());
        assert!(registry.is_exempt(&RouteInfo::new("views.csrf_test")));
        assert!(!registry.is_exempt(&RouteInfo::new("views.other")));
    }

    #[test]
    fn test_group_exemption_covers_all_routes() {
        let group = RouteGroup::new("test_csrf_bp");
        let mut registry = ExemptionRegistry::new();
        registry.register(group.exempt_target());

        assert!(registry.is_exempt(&group.route("csrf_bp")));
        assert!(registry.is_exempt(&group.route("csrf_bp_2")));
        assert!(!registry.is_exempt(&RouteInfo::new("csrf_bp")));
        assert!(!registry.is_exempt(&RouteGroup::new("other").route("csrf_bp")));
    }

    #[test]
    fn test_registration_is_idempotent() {
        let mut registry = ExemptionRegistry::new();
        registry.register("a".exempt_target());
        registry.register(String::from("a").exempt_target());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handler_key_is_stable() {
        let mut registry = ExemptionRegistry::new();
        registry.register(ExemptTarget::Endpoint(key_of(&some_view)));
        assert!(registry.is_exempt(&RouteInfo::for_handler(&some_view)));
    }
}
