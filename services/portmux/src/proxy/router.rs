//! Route table and routing decisions.
//!
//! Routes bind a protocol identifier to one backend endpoint. The table is
//! built once at startup and is read-only afterwards, so concurrent lookups
//! share it through an `Arc` without locking.
//!
//! Duplicate protocol identifiers are accepted, but lookup scans in
//! insertion order, so only the first one registered is ever matched.

use std::sync::Arc;

use tracing::{debug, warn};

use super::endpoint::Endpoint;
use crate::error::ConfigError;

/// Binds one protocol identifier to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    protocol: String,
    destination: Endpoint,
}

impl Route {
    /// Create a new route.
    ///
    /// Fails with `InvalidRoute` when the protocol identifier is blank.
    pub fn new(protocol: impl Into<String>, destination: Endpoint) -> Result<Self, ConfigError> {
        let protocol: String = protocol.into();
        let protocol = protocol.trim();

        if protocol.is_empty() {
            return Err(ConfigError::InvalidRoute(format!(
                "protocol identifier must not be empty (destination {})",
                destination
            )));
        }

        Ok(Self {
            protocol: protocol.to_string(),
            destination,
        })
    }

    /// Build a route from optional parts, as read from configuration.
    ///
    /// A missing destination is an `InvalidRoute`, not an endpoint error.
    pub fn from_parts(
        protocol: Option<&str>,
        destination: Option<Endpoint>,
    ) -> Result<Self, ConfigError> {
        let protocol = protocol.unwrap_or_default();
        match destination {
            Some(destination) => Self::new(protocol, destination),
            None => Err(ConfigError::InvalidRoute(format!(
                "route '{}' has no destination endpoint",
                protocol
            ))),
        }
    }

    /// Whether this route serves `protocol` (ASCII case-insensitive).
    pub fn can_handle(&self, protocol: &str) -> bool {
        self.protocol.eq_ignore_ascii_case(protocol)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn destination(&self) -> &Endpoint {
        &self.destination
    }
}

/// Ordered collection of routes, queried by protocol identifier.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Create a new empty route table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route.
    ///
    /// A route whose protocol is already registered is kept but can never
    /// match.
    pub fn add(&mut self, route: Route) {
        if let Some(existing) = self.find_route(route.protocol()) {
            warn!(
                protocol = %route.protocol(),
                active_destination = %existing.destination(),
                shadowed_destination = %route.destination(),
                "Duplicate route registered; first registration wins"
            );
        } else {
            debug!(
                protocol = %route.protocol(),
                destination = %route.destination(),
                "Route registered"
            );
        }
        self.routes.push(route);
    }

    /// First route, in insertion order, that handles `protocol`.
    pub fn find_route(&self, protocol: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.can_handle(protocol))
    }

    /// All routes in insertion order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Get the total number of routes, dead duplicates included.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if the route table is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl FromIterator<Route> for RouteTable {
    fn from_iter<I: IntoIterator<Item = Route>>(iter: I) -> Self {
        let mut table = RouteTable::new();
        for route in iter {
            table.add(route);
        }
        table
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;
