/// The host's notion of "where the user is".
///
/// The demand cache only needs a stable identifier per screen; how routing
/// works is up to the host.
pub trait NavigationContext {
    /// Stable identifier of the active route.
    fn route_id(&self) -> String;
}

impl NavigationContext for str {
    fn route_id(&self) -> String {
        self.to_owned()
    }
}

impl NavigationContext for String {
    fn route_id(&self) -> String {
        self.clone()
    }
}

/// A fixed route identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route(pub String);

impl Route {
    /// Wrap a route identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl NavigationContext for Route {
    fn route_id(&self) -> String {
        self.0.clone()
    }
}

/// Scope name the demand cache uses for a navigation context.
pub fn route_scope(context: &(impl NavigationContext + ?Sized)) -> String {
    format!("route:{}", context.route_id())
}
