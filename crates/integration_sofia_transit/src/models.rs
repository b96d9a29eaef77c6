//! Transit data models
//!
//! Raw provider payloads as returned by `getVirtualTable`, and the normalized
//! line records published to consumers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Vehicle type codes used by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleType {
    /// Bus (1)
    Bus,
    /// Tram (2)
    Tram,
    /// Metro (3)
    Metro,
    /// Trolleybus (4)
    Trolleybus,
    /// Night line (5)
    Night,
    /// Anything else, including a missing type
    Other,
}

impl VehicleType {
    /// Map the provider's numeric code
    #[must_use]
    pub const fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(1) => Self::Bus,
            Some(2) => Self::Tram,
            Some(3) => Self::Metro,
            Some(4) => Self::Trolleybus,
            Some(5) => Self::Night,
            _ => Self::Other,
        }
    }

    /// Prefix used in composite line ids (metro handled separately)
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Bus => "A",
            Self::Tram => "TM",
            Self::Metro => "M",
            Self::Trolleybus => "TB",
            Self::Night => "N",
            Self::Other => "",
        }
    }
}

/// One route record of a stop, read leniently
///
/// Fields of the wrong type are treated as absent so that a single odd record
/// never fails the whole stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRoute {
    /// Numeric vehicle type
    pub kind: Option<i64>,
    /// Display name ("94", "M1", ...); numbers are stringified
    pub name: Option<String>,
    /// `"<begin> - <end>"`
    pub route_name: Option<String>,
    /// External id, used to key metro lines
    pub ext_id: Option<String>,
    /// Minutes until each upcoming arrival, in provider order
    pub arrivals: Vec<i64>,
}

impl RawRoute {
    /// Read a route record from JSON
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let arrivals = value
            .get("details")
            .and_then(Value::as_array)
            .map(|details| {
                details
                    .iter()
                    .filter_map(|d| d.get("t").and_then(as_minutes))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            kind: value.get("type").and_then(Value::as_i64),
            name: value.get("name").and_then(as_text),
            route_name: value
                .get("route_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            ext_id: value.get("route_ext_id").and_then(as_text),
            arrivals,
        }
    }
}

/// Route records of one stop, in provider order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawProviderPayload {
    /// Route records
    pub routes: Vec<RawRoute>,
}

impl RawProviderPayload {
    /// Build from the parsed response body
    ///
    /// The backend answers with an object keyed by route, or with `[]` when a
    /// stop has nothing scheduled. Anything else is not a payload.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let routes = match value {
            Value::Object(map) => map.values().map(RawRoute::from_value).collect(),
            Value::Array(items) => items.iter().map(RawRoute::from_value).collect(),
            _ => return None,
        };
        Some(Self { routes })
    }

    /// Number of route records
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the stop had no routes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A normalized line at a stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRecord {
    /// Composite id `"{stop}_{prefix}{name}"`
    pub line: String,
    /// Minutes until the next arrival
    pub next_bus: Option<i64>,
    /// Minutes until the arrivals after that
    pub after_next: Vec<i64>,
    /// First stop of the route
    pub bus_stop_begin: String,
    /// Last stop of the route
    pub bus_stop_end: String,
}

/// Everything published by one refresh cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Lines of every stop, stop-then-route order
    pub lines: Vec<LineRecord>,
}

impl AggregateResult {
    /// Find a line by its composite id
    #[must_use]
    pub fn line(&self, id: &str) -> Option<&LineRecord> {
        self.lines.iter().find(|l| l.line == id)
    }

    /// Whether no line was collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

fn as_minutes(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
