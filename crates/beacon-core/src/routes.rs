//! Route geometry lookup.
//!
//! Stops and path polylines are served to passenger apps so they can draw a
//! route and place vehicles along it. The relay itself never reads them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Both components are finite numbers.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

/// A stop along a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub name: String,
    pub coordinates: LatLng,
    /// Scheduled arrival time as printed in the timetable ("08:15").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_time: Option<String>,
    /// Position of the stop along the route, starting at 0.
    pub order: u32,
}

/// Stops and path of one route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteGeometry {
    pub route_id: String,
    pub origin: String,
    pub destination: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub stops: Vec<Stop>,
    #[serde(default)]
    pub path: Vec<LatLng>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_color() -> String {
    "#2563eb".to_string()
}

fn default_active() -> bool {
    true
}

impl RouteGeometry {
    /// Stops sorted by their order along the route.
    #[must_use]
    pub fn ordered_stops(&self) -> Vec<&Stop> {
        let mut stops: Vec<&Stop> = self.stops.iter().collect();
        stops.sort_by_key(|s| s.order);
        stops
    }
}

/// Lookup of route geometry by route id.
pub trait RouteDirectory: Send + Sync {
    /// Geometry for one route.
    fn route(&self, route_id: &str) -> Option<RouteGeometry>;

    /// All known routes, ordered by route id.
    fn routes(&self) -> Vec<RouteGeometry>;
}

/// Route directory held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryRouteDirectory {
    routes: BTreeMap<String, RouteGeometry>,
}

impl MemoryRouteDirectory {
    /// Build a directory from a list of routes. Later duplicates win.
    #[must_use]
    pub fn new(routes: impl IntoIterator<Item = RouteGeometry>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|r| (r.route_id.clone(), r))
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RouteDirectory for MemoryRouteDirectory {
    fn route(&self, route_id: &str) -> Option<RouteGeometry> {
        self.routes.get(route_id).cloned()
    }

    fn routes(&self) -> Vec<RouteGeometry> {
        self.routes.values().cloned().collect()
    }
}
