//! CORS HTTP filter.
//!
//! The chain carries an empty `Cors` marker; the policy itself is written on
//! each route as a `CorsPolicy` override.

use envoy_types::pb::envoy::config::route::v3::Route;
use envoy_types::pb::envoy::extensions::filters::http::cors::v3::{
    Cors as CorsFilterProto, CorsPolicy as FilterCorsPolicy,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::google::protobuf::BoolValue;
use http::{header::HeaderName, Method};

use super::{hcm_contains_filter, set_route_filter_config, typed_filter, FilterType, HttpFilterPlugin};
use crate::errors::ErrorList;
use crate::ir::{Cors, HttpListener, HttpRoute};
use crate::xds::filters::{any_from_message, invalid_config};
use crate::xds::route::build_string_matcher;

pub const CORS_FILTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.cors.v3.Cors";
pub const FILTER_CORS_POLICY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.cors.v3.CorsPolicy";
const MAX_AGE_LIMIT_SECONDS: u64 = 315_576_000_000; // 10,000 years

#[derive(Debug, Default)]
pub struct CorsFilter;

impl HttpFilterPlugin for CorsFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Cors
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        let name = FilterType::Cors.filter_name();
        if !listener.any_route(|r| r.cors().is_some()) || hcm_contains_filter(hcm, name) {
            return Ok(());
        }
        hcm.http_filters.push(typed_filter(name, CORS_FILTER_TYPE_URL, &CorsFilterProto::default()));
        Ok(())
    }

    fn patch_route(
        &self,
        route: &mut Route,
        ir_route: &HttpRoute,
        _listener: &HttpListener,
    ) -> crate::Result<()> {
        let Some(cors) = ir_route.cors() else {
            return Ok(());
        };
        let policy = build_cors_policy(cors)?;
        set_route_filter_config(
            route,
            FilterType::Cors.filter_name(),
            any_from_message(FILTER_CORS_POLICY_TYPE_URL, &policy),
        )
    }
}

/// Validate configuration for logical and security rules.
pub fn validate_cors(cors: &Cors) -> crate::Result<()> {
    if cors.allow_origins.is_empty() {
        return Err(invalid_config("CORS configuration requires at least one allowed origin matcher"));
    }

    for method in &cors.allow_methods {
        let method = method.trim();
        if method.is_empty() {
            return Err(invalid_config("CORS allow_methods entries cannot be empty"));
        }
        if method != "*" {
            Method::from_bytes(method.as_bytes()).map_err(|_| {
                invalid_config(format!("Invalid HTTP method in CORS allow_methods: {method}"))
            })?;
        }
    }

    for header in &cors.allow_headers {
        validate_header_name(header, "allow_headers")?;
    }
    for header in &cors.expose_headers {
        validate_header_name(header, "expose_headers")?;
    }

    if cors.allow_credentials
        && cors.allow_origins.iter().any(|origin| origin.exact.as_deref().map(str::trim) == Some("*"))
    {
        return Err(invalid_config(
            "CORS allow_credentials cannot be true when allow_origins contains '*'",
        ));
    }

    if let Some(max_age) = cors.max_age_secs {
        if max_age > MAX_AGE_LIMIT_SECONDS {
            return Err(invalid_config(format!(
                "CORS max_age must be <= {MAX_AGE_LIMIT_SECONDS} seconds"
            )));
        }
    }
    Ok(())
}

pub fn build_cors_policy(cors: &Cors) -> crate::Result<FilterCorsPolicy> {
    validate_cors(cors)?;

    Ok(FilterCorsPolicy {
        allow_origin_string_match: cors
            .allow_origins
            .iter()
            .map(build_string_matcher)
            .collect::<crate::Result<_>>()?,
        allow_methods: join_header_values(&cors.allow_methods),
        allow_headers: join_header_values(&cors.allow_headers),
        expose_headers: join_header_values(&cors.expose_headers),
        max_age: cors.max_age_secs.map(|value| value.to_string()).unwrap_or_default(),
        allow_credentials: cors.allow_credentials.then_some(BoolValue { value: true }),
        ..Default::default()
    })
}

fn join_header_values(values: &[String]) -> String {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn validate_header_name(value: &str, field: &str) -> crate::Result<()> {
    if value.trim().is_empty() {
        return Err(invalid_config(format!("CORS {field} entries cannot be empty")));
    }

    if value.trim() != "*" {
        HeaderName::from_bytes(value.trim().as_bytes()).map_err(|_| {
            invalid_config(format!("Invalid header name '{value}' in CORS {field}"))
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{SecurityFeatures, StringMatch};
    use envoy_types::pb::envoy::r#type::matcher::v3::string_matcher::MatchPattern;
    use prost::Message;

    fn cors() -> Cors {
        Cors {
            allow_origins: vec![StringMatch::exact("https://example.com")],
            allow_methods: vec!["GET".into(), " POST ".into()],
            allow_headers: vec!["content-type".into()],
            max_age_secs: Some(600),
            ..Default::default()
        }
    }

    #[test]
    fn builds_policy_with_joined_headers() {
        let policy = build_cors_policy(&cors()).expect("policy");
        assert_eq!(policy.allow_methods, "GET,POST");
        assert_eq!(policy.max_age, "600");
        assert!(matches!(
            policy.allow_origin_string_match[0].match_pattern,
            Some(MatchPattern::Exact(ref origin)) if origin == "https://example.com"
        ));
        assert!(policy.allow_credentials.is_none());
    }

    #[test]
    fn wildcard_origin_cannot_allow_credentials() {
        let config = Cors {
            allow_origins: vec![StringMatch::exact("*")],
            allow_credentials: true,
            ..Default::default()
        };
        assert!(validate_cors(&config).is_err());
    }

    #[test]
    fn rejects_invalid_method_and_header() {
        let mut config = cors();
        config.allow_methods = vec!["GE T".into()];
        assert!(validate_cors(&config).is_err());

        let mut config = cors();
        config.expose_headers = vec!["bad header".into()];
        assert!(validate_cors(&config).is_err());
    }

    #[test]
    fn route_override_is_written_once() {
        let mut ir_route = HttpRoute::new("r1");
        ir_route.security = Some(SecurityFeatures { cors: Some(cors()), ..Default::default() });
        let listener = HttpListener::new("l1", "0.0.0.0", 80).with_route(ir_route.clone());

        let mut route = Route { name: "r1".into(), ..Default::default() };
        CorsFilter.patch_route(&mut route, &ir_route, &listener).expect("first patch");
        let any = &route.typed_per_filter_config["envoy.filters.http.cors"];
        assert_eq!(any.type_url, FILTER_CORS_POLICY_TYPE_URL);
        let decoded = FilterCorsPolicy::decode(any.value.as_slice()).expect("decode policy");
        assert_eq!(decoded.allow_headers, "content-type");

        let err = CorsFilter.patch_route(&mut route, &ir_route, &listener).expect_err("duplicate");
        assert!(matches!(err, crate::Error::DuplicateRouteFilter { .. }));
    }
}
