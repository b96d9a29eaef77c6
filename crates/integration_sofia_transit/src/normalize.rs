//! Turn raw route records into published line records

use crate::models::{LineRecord, RawRoute, VehicleType};

/// Separator between the two endpoints in `route_name`
const ROUTE_SEPARATOR: &str = " - ";

/// Normalize one route record of `stop_id`
///
/// A record is never dropped: missing fields fall back to empty values.
#[must_use]
pub fn normalize_route(stop_id: &str, route: &RawRoute) -> LineRecord {
    let mut arrivals = route.arrivals.iter().copied();
    let next_bus = arrivals.next();
    let after_next: Vec<i64> = arrivals.collect();

    let (prefix, name) = resolve_name(route);
    let line = if prefix.is_empty() {
        format!("{stop_id}_{name}")
    } else {
        format!("{stop_id}_{prefix}{name}")
    };

    let (bus_stop_begin, bus_stop_end) = route
        .route_name
        .as_deref()
        .and_then(|r| r.split_once(ROUTE_SEPARATOR))
        .map(|(begin, end)| (begin.to_string(), end.to_string()))
        .unwrap_or_default();

    LineRecord {
        line,
        next_bus,
        after_next,
        bus_stop_begin,
        bus_stop_end,
    }
}

/// Normalize every route of a stop, keeping provider order
pub fn normalize_stop<'a>(
    stop_id: &'a str,
    routes: &'a [RawRoute],
) -> impl Iterator<Item = LineRecord> + 'a {
    routes.iter().map(move |route| normalize_route(stop_id, route))
}

/// Pick the id prefix and the name part of a line id
///
/// Metro lines are keyed by their external id. A display name that already
/// reads "M1" is used as is; otherwise the external id is used, prefixed with
/// "M" unless it already carries it.
fn resolve_name(route: &RawRoute) -> (&'static str, String) {
    let kind = VehicleType::from_code(route.kind);
    let name = route.name.clone().unwrap_or_default();

    if kind != VehicleType::Metro {
        return (kind.prefix(), name);
    }

    if starts_with_m(&name) {
        return ("", name);
    }

    match route.ext_id.as_deref() {
        Some(ext_id) if starts_with_m(ext_id) => ("", ext_id.to_string()),
        Some(ext_id) if !ext_id.is_empty() => (kind.prefix(), ext_id.to_string()),
        _ => (kind.prefix(), name),
    }
}

fn starts_with_m(text: &str) -> bool {
    text.starts_with(['M', 'm'])
}
