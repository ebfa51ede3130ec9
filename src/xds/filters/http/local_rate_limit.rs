//! Local (in-proxy) rate limiting.
//!
//! The listener carries an empty `LocalRateLimit` filter. Each limited route
//! overrides it with its own token bucket and descriptors, and adds the
//! route `rate_limits` actions producing those descriptors.

use envoy_types::pb::envoy::config::core::v3::RuntimeFractionalPercent;
use envoy_types::pb::envoy::config::route::v3::{
    rate_limit::{
        action::{ActionSpecifier, HeaderValueMatch},
        Action as RateLimitAction,
    },
    route::Action,
    RateLimit, Route, RouteAction,
};
use envoy_types::pb::envoy::extensions::common::ratelimit::v3::{
    rate_limit_descriptor::Entry, LocalRateLimitDescriptor,
};
use envoy_types::pb::envoy::extensions::filters::http::local_ratelimit::v3::LocalRateLimit as LocalRateLimitProto;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::envoy::r#type::v3::{fractional_percent::DenominatorType, FractionalPercent, TokenBucket};
use envoy_types::pb::google::protobuf::{BoolValue, UInt32Value};

use super::{hcm_contains_filter, set_route_filter_config, typed_filter, FilterType, HttpFilterPlugin};
use crate::errors::ErrorList;
use crate::ir::{HttpListener, HttpRoute, LocalRateLimit, RateLimitValue, StringMatch};
use crate::xds::filters::{any_from_message, duration_from_secs, invalid_config};
use crate::xds::route::build_header_matcher;

const LOCAL_RATE_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.local_ratelimit.v3.LocalRateLimit";
pub const LOCAL_RATE_LIMIT_STAT_PREFIX: &str = "http_local_rate_limiter";

#[derive(Debug, Default)]
pub struct LocalRateLimitFilter;

/// Descriptor key and value of the `match_index`th header match of a rule.
pub fn rule_descriptor(rule_index: usize, match_index: usize) -> String {
    format!("rule-{rule_index}-match-{match_index}")
}

/// Rate limit action emitting `descriptor` when `header` matches.
pub fn header_value_match_action(
    descriptor: &str,
    header: &StringMatch,
) -> crate::Result<RateLimitAction> {
    Ok(RateLimitAction {
        action_specifier: Some(ActionSpecifier::HeaderValueMatch(HeaderValueMatch {
            descriptor_key: descriptor.to_string(),
            descriptor_value: descriptor.to_string(),
            expect_match: Some(BoolValue { value: true }),
            headers: vec![build_header_matcher(header)?],
            ..Default::default()
        })),
        ..Default::default()
    })
}

pub fn token_bucket(limit: &RateLimitValue) -> crate::Result<TokenBucket> {
    if limit.requests == 0 {
        return Err(invalid_config("rate limit must allow at least one request"));
    }
    Ok(TokenBucket {
        max_tokens: limit.requests,
        tokens_per_fill: Some(UInt32Value { value: limit.requests }),
        fill_interval: Some(duration_from_secs(limit.unit.as_secs())),
        ..Default::default()
    })
}

/// Route action of a forwarding route; redirects and direct responses have none.
pub fn route_action_mut(route: &mut Route) -> Option<&mut RouteAction> {
    match route.action.as_mut() {
        Some(Action::Route(action)) => Some(action),
        _ => None,
    }
}

fn fully_enabled() -> RuntimeFractionalPercent {
    RuntimeFractionalPercent {
        default_value: Some(FractionalPercent {
            numerator: 100,
            denominator: DenominatorType::Hundred as i32,
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl HttpFilterPlugin for LocalRateLimitFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::LocalRateLimit
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        let name = FilterType::LocalRateLimit.filter_name();
        if !listener.any_route(|route| route.local_rate_limit().is_some())
            || hcm_contains_filter(hcm, name)
        {
            return Ok(());
        }
        let config = LocalRateLimitProto {
            stat_prefix: LOCAL_RATE_LIMIT_STAT_PREFIX.to_string(),
            ..Default::default()
        };
        hcm.http_filters.push(typed_filter(name, LOCAL_RATE_LIMIT_TYPE_URL, &config));
        Ok(())
    }

    fn patch_route(
        &self,
        route: &mut Route,
        ir_route: &HttpRoute,
        _listener: &HttpListener,
    ) -> crate::Result<()> {
        let Some(local) = ir_route.local_rate_limit() else {
            return Ok(());
        };
        let (rate_limits, config) = build_local_rate_limit(local)?;

        let Some(action) = route_action_mut(route) else {
            return Ok(());
        };
        if !action.rate_limits.is_empty() {
            return Err(invalid_config("route already carries rate limit actions"));
        }
        action.rate_limits = rate_limits;

        set_route_filter_config(
            route,
            FilterType::LocalRateLimit.filter_name(),
            any_from_message(LOCAL_RATE_LIMIT_TYPE_URL, &config),
        )
    }
}

/// Route actions and the per-route filter config of a local limit. Rule `i`
/// produces one descriptor whose entries are the rule's header matches.
pub fn build_local_rate_limit(
    local: &LocalRateLimit,
) -> crate::Result<(Vec<RateLimit>, LocalRateLimitProto)> {
    let mut rate_limits = Vec::with_capacity(local.rules.len());
    let mut descriptors = Vec::with_capacity(local.rules.len());

    for (rule_index, rule) in local.rules.iter().enumerate() {
        if rule.header_matches.is_empty() {
            return Err(invalid_config(format!(
                "local rate limit rule {rule_index} requires at least one header match"
            )));
        }

        let mut actions = Vec::with_capacity(rule.header_matches.len());
        let mut entries = Vec::with_capacity(rule.header_matches.len());
        for (match_index, header) in rule.header_matches.iter().enumerate() {
            let descriptor = rule_descriptor(rule_index, match_index);
            actions.push(header_value_match_action(&descriptor, header)?);
            entries.push(Entry { key: descriptor.clone(), value: descriptor, ..Default::default() });
        }

        rate_limits.push(RateLimit { actions, ..Default::default() });
        descriptors.push(LocalRateLimitDescriptor {
            entries,
            token_bucket: Some(token_bucket(&rule.limit)?),
            ..Default::default()
        });
    }

    let config = LocalRateLimitProto {
        stat_prefix: LOCAL_RATE_LIMIT_STAT_PREFIX.to_string(),
        token_bucket: Some(token_bucket(&local.default)?),
        filter_enabled: Some(fully_enabled()),
        filter_enforced: Some(fully_enabled()),
        descriptors,
        always_consume_default_token_bucket: Some(BoolValue { value: false }),
        ..Default::default()
    };
    Ok((rate_limits, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{RateLimitRule, RateLimitUnit, TrafficFeatures};
    use envoy_types::pb::envoy::config::route::v3::RedirectAction;

    fn limited(name: &str) -> HttpRoute {
        let mut route = HttpRoute::new(name);
        route.traffic = Some(TrafficFeatures {
            local_rate_limit: Some(LocalRateLimit {
                default: RateLimitValue { requests: 100, unit: RateLimitUnit::Minute },
                rules: vec![RateLimitRule {
                    header_matches: vec![
                        StringMatch::exact("one").named("x-user-id"),
                        StringMatch::exact("gold").named("x-tier"),
                    ],
                    limit: RateLimitValue { requests: 10, unit: RateLimitUnit::Second },
                }],
            }),
            ..Default::default()
        });
        route
    }

    fn forwarding(name: &str) -> Route {
        Route {
            name: name.into(),
            action: Some(Action::Route(RouteAction::default())),
            ..Default::default()
        }
    }

    #[test]
    fn listener_gets_one_empty_filter() {
        let listener = HttpListener::new("l1", "0.0.0.0", 80)
            .with_route(limited("a"))
            .with_route(limited("b"));
        let mut hcm = HttpConnectionManager::default();
        LocalRateLimitFilter.patch_hcm(&mut hcm, &listener).expect("patch");
        LocalRateLimitFilter.patch_hcm(&mut hcm, &listener).expect("patch again");
        assert_eq!(hcm.http_filters.len(), 1);
        assert_eq!(hcm.http_filters[0].name, "envoy.filters.http.local_ratelimit");
    }

    #[test]
    fn route_override_carries_descriptors() {
        let ir_route = limited("a");
        let (rate_limits, config) =
            build_local_rate_limit(ir_route.local_rate_limit().expect("limit")).expect("build");

        assert_eq!(rate_limits.len(), 1);
        assert_eq!(rate_limits[0].actions.len(), 2);
        assert_eq!(config.descriptors.len(), 1);
        let keys: Vec<&str> =
            config.descriptors[0].entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["rule-0-match-0", "rule-0-match-1"]);
        assert_eq!(config.token_bucket.map(|b| b.max_tokens), Some(100));
        assert_eq!(
            config.descriptors[0].token_bucket.as_ref().and_then(|b| b.fill_interval.clone()),
            Some(duration_from_secs(1))
        );
    }

    #[test]
    fn patch_route_sets_actions_and_override() {
        let ir_route = limited("a");
        let listener = HttpListener::new("l1", "0.0.0.0", 80);
        let mut route = forwarding("a");
        LocalRateLimitFilter.patch_route(&mut route, &ir_route, &listener).expect("patch");

        assert!(route.typed_per_filter_config.contains_key("envoy.filters.http.local_ratelimit"));
        assert_eq!(route_action_mut(&mut route).map(|a| a.rate_limits.len()), Some(1));
    }

    #[test]
    fn redirect_routes_are_left_alone() {
        let listener = HttpListener::new("l1", "0.0.0.0", 80);
        let mut route = Route {
            name: "a".into(),
            action: Some(Action::Redirect(RedirectAction::default())),
            ..Default::default()
        };
        LocalRateLimitFilter.patch_route(&mut route, &limited("a"), &listener).expect("patch");
        assert!(route.typed_per_filter_config.is_empty());
    }

    #[test]
    fn zero_request_limit_is_rejected() {
        let local = LocalRateLimit {
            default: RateLimitValue { requests: 0, unit: RateLimitUnit::Second },
            rules: vec![],
        };
        assert!(build_local_rate_limit(&local).is_err());
    }
}
