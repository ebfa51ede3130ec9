//! External Authorization (ext_authz) HTTP filter.
//!
//! Every route with an external auth policy gets its own filter instance,
//! named `envoy.filters.http.ext_authz/<route>`, disabled at the listener
//! and switched on by the route itself. The auth backend is registered as a
//! shared cluster.

use envoy_types::pb::envoy::config::core::v3::{
    grpc_service::{EnvoyGrpc, TargetSpecifier},
    http_uri::HttpUpstreamType,
    GrpcService as GrpcServiceProto, HttpUri,
};
use envoy_types::pb::envoy::config::route::v3::Route;
use envoy_types::pb::envoy::extensions::filters::http::ext_authz::v3::{
    ext_authz::Services, AuthorizationResponse, ExtAuthz as ExtAuthzProto, HttpService,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, ListStringMatcher, StringMatcher,
};
use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use tracing::debug;
use url::Url;

use super::{
    disabled_filter, enable_filter_on_route, hcm_contains_filter, per_route_filter_name,
    FilterType, HttpFilterPlugin,
};
use crate::errors::{Error, ErrorList};
use crate::ir::{AppProtocol, ExtAuth, HttpExtAuthService, HttpListener, HttpRoute};
use crate::xds::cluster::{add_xds_cluster, ClusterArgs};
use crate::xds::filters::{duration_from_secs, invalid_config};
use crate::xds::resources::ResourceTable;

pub const EXT_AUTHZ_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";
const EXT_SERVICE_TIMEOUT_SECS: i64 = 10;

#[derive(Debug, Default)]
pub struct ExtAuthzFilter;

impl HttpFilterPlugin for ExtAuthzFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::ExtAuthz
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        for route in &listener.routes {
            let Some(ext_auth) = route.ext_auth() else {
                continue;
            };
            let name = per_route_filter_name(FilterType::ExtAuthz, &route.name);
            if hcm_contains_filter(hcm, &name) {
                continue;
            }
            match build_ext_authz(ext_auth) {
                Ok(config) => hcm.http_filters.push(disabled_filter(name, EXT_AUTHZ_TYPE_URL, &config)),
                Err(err) => debug!(route = %route.name, error = %err, "Skipping ext_authz filter"),
            }
        }
        Ok(())
    }

    fn patch_route(
        &self,
        route: &mut Route,
        ir_route: &HttpRoute,
        _listener: &HttpListener,
    ) -> crate::Result<()> {
        let Some(ext_auth) = ir_route.ext_auth() else {
            return Ok(());
        };
        build_ext_authz(ext_auth)?;
        enable_filter_on_route(route, &per_route_filter_name(FilterType::ExtAuthz, &ir_route.name))
    }

    fn patch_resources(
        &self,
        table: &mut ResourceTable,
        routes: &[HttpRoute],
    ) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new();
        for route in routes {
            let Some(ext_auth) = route.ext_auth() else {
                continue;
            };
            if build_ext_authz(ext_auth).is_err() {
                continue;
            }
            let result = backend_cluster_args(ext_auth)
                .and_then(|args| add_xds_cluster(table, &args));
            if let Err(err) = result {
                errors.push(err.for_route(&route.name));
            }
        }
        errors.into_result()
    }
}

pub fn build_ext_authz(ext_auth: &ExtAuth) -> crate::Result<ExtAuthzProto> {
    let services = match (&ext_auth.grpc, &ext_auth.http) {
        (Some(_), Some(_)) => {
            return Err(invalid_config("ext auth cannot configure both a gRPC and an HTTP service"))
        }
        (None, None) => {
            return Err(invalid_config("ext auth requires either a gRPC or an HTTP service"))
        }
        (Some(grpc), None) => Services::GrpcService(GrpcServiceProto {
            target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
                cluster_name: grpc.destination.name.clone(),
                authority: grpc.authority.clone().unwrap_or_default(),
                ..Default::default()
            })),
            timeout: Some(duration_from_secs(EXT_SERVICE_TIMEOUT_SECS)),
            ..Default::default()
        }),
        (None, Some(http)) => Services::HttpService(http_service(http)?),
    };

    Ok(ExtAuthzProto {
        services: Some(services),
        failure_mode_allow: ext_auth.failure_open,
        status_on_error: Some(HttpStatus {
            code: StatusCode::ServiceUnavailable as i32,
            ..Default::default()
        }),
        allowed_headers: exact_list(&ext_auth.headers_to_ext_auth),
        ..Default::default()
    })
}

/// The filter only uses the cluster to reach the service; the URI carries
/// the authority and path of the check request.
fn http_service(http: &HttpExtAuthService) -> crate::Result<HttpService> {
    let mut uri = Url::parse(&format!("http://{}", http.authority)).map_err(|e| {
        invalid_config(format!("invalid ext auth authority '{}': {e}", http.authority))
    })?;
    uri.set_path(&http.path);

    Ok(HttpService {
        server_uri: Some(HttpUri {
            uri: uri.to_string(),
            http_upstream_type: Some(HttpUpstreamType::Cluster(http.destination.name.clone())),
            timeout: Some(duration_from_secs(EXT_SERVICE_TIMEOUT_SECS)),
            ..Default::default()
        }),
        authorization_response: Some(AuthorizationResponse {
            allowed_upstream_headers: Some(ListStringMatcher {
                patterns: exact_matchers(&http.headers_to_backend),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn exact_matchers(values: &[String]) -> Vec<StringMatcher> {
    values
        .iter()
        .map(|value| StringMatcher {
            match_pattern: Some(MatchPattern::Exact(value.clone())),
            ignore_case: false,
            ..Default::default()
        })
        .collect()
}

fn exact_list(values: &[String]) -> Option<ListStringMatcher> {
    (!values.is_empty())
        .then(|| ListStringMatcher { patterns: exact_matchers(values), ..Default::default() })
}

fn backend_cluster_args(ext_auth: &ExtAuth) -> crate::Result<ClusterArgs> {
    let destination = ext_auth
        .destination()
        .ok_or_else(|| invalid_config("ext auth has no backend destination"))?;
    if !destination.has_endpoints() {
        return Err(Error::config(format!(
            "ext auth destination '{}' has no endpoints",
            destination.name
        )));
    }

    let mut args = ClusterArgs::for_destination(destination);
    if ext_auth.grpc.is_some() {
        for setting in &mut args.settings {
            if setting.protocol == AppProtocol::Http {
                setting.protocol = AppProtocol::Grpc;
            }
        }
    }
    Ok(args)
}
