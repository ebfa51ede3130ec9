//! Health check filter served by the proxy itself.
//!
//! Listener-level only: the filter answers requests on the configured path
//! before any other filter runs.

use envoy_types::pb::envoy::config::route::v3::{header_matcher::HeaderMatchSpecifier, HeaderMatcher, Route};
use envoy_types::pb::envoy::extensions::filters::http::health_check::v3::HealthCheck as HealthCheckProto;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::google::protobuf::BoolValue;

use super::{hcm_contains_filter, typed_filter, FilterType, HttpFilterPlugin};
use crate::errors::{Error, ErrorList};
use crate::ir::{HealthCheckSettings, HttpListener, HttpRoute};
use crate::xds::filters::invalid_config;

const HEALTH_CHECK_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.health_check.v3.HealthCheck";

#[derive(Debug, Default)]
pub struct HealthCheckFilter;

impl HttpFilterPlugin for HealthCheckFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::HealthCheck
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        let name = FilterType::HealthCheck.filter_name();
        let Some(settings) = &listener.health_check else {
            return Ok(());
        };
        if hcm_contains_filter(hcm, name) {
            return Ok(());
        }
        let proto = build_health_check(settings)
            .map_err(|err| ErrorList::from(Error::for_listener(err, &listener.name)))?;
        hcm.http_filters.push(typed_filter(name, HEALTH_CHECK_TYPE_URL, &proto));
        Ok(())
    }

    fn patch_route(
        &self,
        _route: &mut Route,
        _ir_route: &HttpRoute,
        _listener: &HttpListener,
    ) -> crate::Result<()> {
        Ok(())
    }
}

pub fn build_health_check(settings: &HealthCheckSettings) -> crate::Result<HealthCheckProto> {
    if settings.path.trim().is_empty() {
        return Err(invalid_config("health check path cannot be empty"));
    }
    if !settings.path.starts_with('/') {
        return Err(invalid_config("health check path must start with '/'"));
    }

    Ok(HealthCheckProto {
        pass_through_mode: Some(BoolValue { value: false }),
        headers: vec![HeaderMatcher {
            name: ":path".to_string(),
            header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(StringMatcher {
                match_pattern: Some(MatchPattern::Exact(settings.path.clone())),
                ignore_case: false,
                ..Default::default()
            })),
            ..Default::default()
        }],
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_filter_only_for_listeners_with_health_check() {
        let mut hcm = HttpConnectionManager::default();
        HealthCheckFilter
            .patch_hcm(&mut hcm, &HttpListener::new("plain", "0.0.0.0", 80))
            .expect("patch");
        assert!(hcm.http_filters.is_empty());

        let mut listener = HttpListener::new("checked", "0.0.0.0", 80);
        listener.health_check = Some(HealthCheckSettings { path: "/ready".into() });
        HealthCheckFilter.patch_hcm(&mut hcm, &listener).expect("patch");
        HealthCheckFilter.patch_hcm(&mut hcm, &listener).expect("patch again");
        assert_eq!(hcm.http_filters.len(), 1);
        assert_eq!(hcm.http_filters[0].name, "envoy.filters.http.health_check");
    }

    #[test]
    fn relative_path_is_rejected() {
        let mut listener = HttpListener::new("checked", "0.0.0.0", 80);
        listener.health_check = Some(HealthCheckSettings { path: "ready".into() });
        let errors = HealthCheckFilter
            .patch_hcm(&mut HttpConnectionManager::default(), &listener)
            .expect_err("relative path");
        assert!(errors.to_string().contains("listener 'checked'"));
    }
}
