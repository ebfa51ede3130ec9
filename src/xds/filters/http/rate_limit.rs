//! Global rate limiting through an external rate limit service.
//!
//! Only active when the translator settings name a service. Every listener
//! with a limited route gets a `ratelimit` filter whose domain is the
//! listener name; routes emit descriptors rooted at their own name.

use envoy_types::pb::envoy::config::core::v3::{
    grpc_service::{EnvoyGrpc, TargetSpecifier},
    ApiVersion, GrpcService,
};
use envoy_types::pb::envoy::config::ratelimit::v3::RateLimitServiceConfig;
use envoy_types::pb::envoy::config::route::v3::{
    rate_limit::{
        action::{ActionSpecifier, GenericKey},
        Action as RateLimitAction,
    },
    RateLimit, Route,
};
use envoy_types::pb::envoy::extensions::filters::http::ratelimit::v3::{
    rate_limit::XRateLimitHeadersRfcVersion, RateLimit as RateLimitProto,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use tracing::warn;

use super::local_rate_limit::{header_value_match_action, route_action_mut, rule_descriptor};
use super::{hcm_contains_filter, typed_filter, FilterType, HttpFilterPlugin};
use crate::config::GlobalRateLimitSettings;
use crate::errors::ErrorList;
use crate::ir::{AppProtocol, DestinationEndpoint, DestinationSetting, GlobalRateLimit, HttpListener, HttpRoute};
use crate::xds::cluster::{add_xds_cluster, upstream_tls_socket, url_to_cluster, ClusterArgs};
use crate::xds::filters::duration_from_millis;
use crate::xds::resources::ResourceTable;

const RATE_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ratelimit.v3.RateLimit";
pub const RATE_LIMIT_CLUSTER_NAME: &str = "ratelimit_cluster";

#[derive(Debug, Default)]
pub struct RateLimitFilter {
    settings: Option<GlobalRateLimitSettings>,
}

impl RateLimitFilter {
    pub fn new(settings: Option<GlobalRateLimitSettings>) -> Self {
        Self { settings }
    }
}

impl HttpFilterPlugin for RateLimitFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::RateLimit
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        if !listener.any_route(|route| route.global_rate_limit().is_some()) {
            return Ok(());
        }
        let Some(settings) = &self.settings else {
            warn!(
                listener = %listener.name,
                "Routes request global rate limiting but no rate limit service is configured"
            );
            return Ok(());
        };

        let name = FilterType::RateLimit.filter_name();
        if !hcm_contains_filter(hcm, name) {
            let config = build_rate_limit_filter(&listener.name, settings);
            hcm.http_filters.push(typed_filter(name, RATE_LIMIT_TYPE_URL, &config));
        }
        Ok(())
    }

    fn patch_route(
        &self,
        route: &mut Route,
        ir_route: &HttpRoute,
        _listener: &HttpListener,
    ) -> crate::Result<()> {
        let Some(global) = ir_route.global_rate_limit() else {
            return Ok(());
        };
        if self.settings.is_none() {
            return Ok(());
        }
        let rate_limits = build_route_rate_limits(&ir_route.name, global)?;
        if let Some(action) = route_action_mut(route) {
            action.rate_limits.extend(rate_limits);
        }
        Ok(())
    }

    fn patch_resources(
        &self,
        table: &mut ResourceTable,
        routes: &[HttpRoute],
    ) -> Result<(), ErrorList> {
        let Some(settings) = &self.settings else {
            return Ok(());
        };
        if !routes.iter().any(|route| route.global_rate_limit().is_some()) {
            return Ok(());
        }
        let args = rate_limit_cluster_args(settings)?;
        add_xds_cluster(table, &args)?;
        Ok(())
    }
}

pub fn build_rate_limit_filter(domain: &str, settings: &GlobalRateLimitSettings) -> RateLimitProto {
    RateLimitProto {
        domain: domain.to_string(),
        rate_limit_service: Some(RateLimitServiceConfig {
            grpc_service: Some(GrpcService {
                target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
                    cluster_name: RATE_LIMIT_CLUSTER_NAME.to_string(),
                    ..Default::default()
                })),
                ..Default::default()
            }),
            transport_api_version: ApiVersion::V3 as i32,
            ..Default::default()
        }),
        enable_x_ratelimit_headers: XRateLimitHeadersRfcVersion::DraftVersion03 as i32,
        timeout: settings.timeout_ms.map(duration_from_millis),
        failure_mode_deny: settings.failure_mode_deny,
        ..Default::default()
    }
}

fn generic_key(descriptor: &str) -> RateLimitAction {
    RateLimitAction {
        action_specifier: Some(ActionSpecifier::GenericKey(GenericKey {
            descriptor_key: descriptor.to_string(),
            descriptor_value: descriptor.to_string(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// One `RateLimit` per rule. Each starts with the route descriptor, then
/// adds one header match action per header match, or a rule-wide generic
/// key when the rule matches every request.
pub fn build_route_rate_limits(route: &str, global: &GlobalRateLimit) -> crate::Result<Vec<RateLimit>> {
    global
        .rules
        .iter()
        .enumerate()
        .map(|(rule_index, rule)| {
            let mut actions = vec![generic_key(route)];
            for (match_index, header) in rule.header_matches.iter().enumerate() {
                actions.push(header_value_match_action(
                    &rule_descriptor(rule_index, match_index),
                    header,
                )?);
            }
            if rule.header_matches.is_empty() {
                actions.push(generic_key(&format!("rule-{rule_index}-match--1")));
            }
            Ok(RateLimit { actions, ..Default::default() })
        })
        .collect()
}

/// gRPC cluster for the rate limit service behind `service_url`.
pub fn rate_limit_cluster_args(settings: &GlobalRateLimitSettings) -> crate::Result<ClusterArgs> {
    let service = url_to_cluster(&settings.service_url)?;
    let mut setting = DestinationSetting::endpoints(vec![DestinationEndpoint::new(
        service.hostname.clone(),
        service.port,
    )]);
    setting.weight = Some(1);
    setting.protocol = AppProtocol::Grpc;

    Ok(ClusterArgs {
        name: RATE_LIMIT_CLUSTER_NAME.to_string(),
        settings: vec![setting],
        endpoint_type: service.endpoint_type,
        transport_socket: service.tls.then(|| upstream_tls_socket(&service.hostname)),
    })
}
