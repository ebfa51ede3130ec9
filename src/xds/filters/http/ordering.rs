//! Deterministic ordering of the HTTP filter chain.
//!
//! Filters get a priority from a fixed table keyed on their type, are stable
//! sorted by it, and then custom [`FilterPosition`]s are applied in the order
//! they are listed. The router filter always ends the chain.

use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpFilter;
use serde::{Deserialize, Serialize};

use super::FilterType;

/// Priority of filters whose type is not in the table.
pub const DEFAULT_PRIORITY: u32 = 50;

/// Moves every filter of type `name` before the first filter of `before`, or
/// after the last filter of `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPosition {
    pub name: FilterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<FilterType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<FilterType>,
}

impl FilterPosition {
    pub fn before(name: FilterType, anchor: FilterType) -> Self {
        Self { name, before: Some(anchor), after: None }
    }

    pub fn after(name: FilterType, anchor: FilterType) -> Self {
        Self { name, before: None, after: Some(anchor) }
    }
}

/// Ordering priority of a concrete filter name.
pub fn filter_priority(name: &str) -> u32 {
    let Some(filter_type) = FilterType::of_filter_name(name) else {
        return DEFAULT_PRIORITY;
    };
    match filter_type {
        FilterType::HealthCheck => 0,
        FilterType::Fault => 1,
        FilterType::Cors => 2,
        FilterType::ExtAuthz => 3,
        FilterType::ApiKeyAuth => 4,
        FilterType::BasicAuth => 5,
        FilterType::OAuth2 => 6,
        FilterType::JwtAuthn => 7,
        FilterType::StatefulSession => 8,
        FilterType::Buffer => 9,
        FilterType::Lua => 10 + filter_index(name),
        FilterType::ExtProc => 100 + filter_index(name),
        FilterType::Wasm => 200 + filter_index(name),
        FilterType::Rbac => 301,
        FilterType::LocalRateLimit => 302,
        FilterType::RateLimit => 303,
        FilterType::CustomResponse => 304,
        FilterType::CredentialInjector => 305,
        FilterType::Compressor => 306,
        FilterType::Router => 307,
    }
}

/// Index carried in the trailing `/N` segment of a generated filter name;
/// names without a numeric suffix count as index 0.
fn filter_index(name: &str) -> u32 {
    name.rsplit('/').next().and_then(|last| last.parse().ok()).unwrap_or(0)
}

/// Sort a filter chain by priority, keeping patch order between equals, then
/// apply custom positions.
pub fn sort_http_filters(filters: Vec<HttpFilter>, positions: &[FilterPosition]) -> Vec<HttpFilter> {
    let mut filters = filters;
    filters.sort_by_key(|filter| filter_priority(&filter.name));

    for position in positions {
        filters = apply_position(filters, position);
    }

    if let Some(router) = filters.iter().position(|f| FilterType::Router.matches(&f.name)) {
        if router + 1 != filters.len() {
            let router = filters.remove(router);
            filters.push(router);
        }
    }
    filters
}

fn apply_position(filters: Vec<HttpFilter>, position: &FilterPosition) -> Vec<HttpFilter> {
    let anchor_type = match (position.before, position.after) {
        (Some(before), _) => before,
        (None, Some(after)) => after,
        (None, None) => return filters,
    };
    let present = |filter_type: FilterType| filters.iter().any(|f| filter_type.matches(&f.name));
    if anchor_type == position.name || !present(position.name) || !present(anchor_type) {
        return filters;
    }

    let (moving, mut rest): (Vec<_>, Vec<_>) =
        filters.into_iter().partition(|f| position.name.matches(&f.name));

    let insert_at = if position.before.is_some() {
        rest.iter().position(|f| anchor_type.matches(&f.name))
    } else {
        rest.iter().rposition(|f| anchor_type.matches(&f.name)).map(|index| index + 1)
    }
    .unwrap_or(rest.len());

    rest.splice(insert_at..insert_at, moving);
    rest
}
