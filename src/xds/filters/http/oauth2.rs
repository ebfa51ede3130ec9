//! OAuth2 filter driving the OIDC authorization code flow.
//!
//! Each protected route gets its own disabled `envoy.filters.http.oauth2/<route>`
//! entry. The token endpoint becomes a TLS cluster, and the client secret
//! and a generated HMAC key are delivered as generic secrets.

use envoy_types::pb::envoy::config::core::v3::{http_uri::HttpUpstreamType, HttpUri};
use envoy_types::pb::envoy::config::route::v3::Route;
use envoy_types::pb::envoy::extensions::filters::http::oauth2::v3::{
    o_auth2_config::AuthType, o_auth2_credentials::TokenFormation, OAuth2,
    OAuth2Config as OAuth2ConfigProto, OAuth2Credentials,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::envoy::r#type::matcher::v3::{
    path_matcher::Rule, string_matcher::MatchPattern, PathMatcher, StringMatcher,
};
use rand::{rngs::OsRng, RngCore};
use tracing::debug;
use url::Url;

use super::{
    disabled_filter, enable_filter_on_route, hcm_contains_filter, per_route_filter_name,
    FilterType, HttpFilterPlugin,
};
use crate::errors::{Error, ErrorList};
use crate::ir::{HttpListener, HttpRoute, Oidc};
use crate::xds::cluster::{add_url_cluster, url_to_cluster, UrlCluster};
use crate::xds::filters::{duration_from_secs, invalid_config};
use crate::xds::resources::ResourceTable;
use crate::xds::secret::{generic_secret, sds_secret_config};

pub const OAUTH2_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.oauth2.v3.OAuth2";

pub const REDIRECT_URI: &str = "%REQ(x-forwarded-proto)%://%REQ(:authority)%/oauth2/callback";
pub const REDIRECT_PATH: &str = "/oauth2/callback";
pub const SIGNOUT_PATH: &str = "/signout";
const DEFAULT_TOKEN_ENDPOINT_PORT: u32 = 443;
const TOKEN_ENDPOINT_TIMEOUT_SECS: i64 = 10;
pub const DEFAULT_HMAC_SECRET_LENGTH: usize = 32;

#[derive(Debug)]
pub struct OAuth2Filter {
    hmac_secret_length: usize,
}

impl Default for OAuth2Filter {
    fn default() -> Self {
        Self::new(DEFAULT_HMAC_SECRET_LENGTH)
    }
}

impl OAuth2Filter {
    pub fn new(hmac_secret_length: usize) -> Self {
        Self { hmac_secret_length }
    }

    fn hmac_secret(&self, route: &str) -> Secret {
        let mut key = vec![0u8; self.hmac_secret_length];
        OsRng.fill_bytes(&mut key);
        generic_secret(hmac_secret_name(route), key)
    }
}

pub fn client_secret_name(route: &str) -> String {
    format!("{route}/oauth2/client_secret")
}

pub fn hmac_secret_name(route: &str) -> String {
    format!("{route}/oauth2/hmac_secret")
}

pub fn token_endpoint_cluster_name(host: &str) -> String {
    format!("oauth2_token_endpoint_{host}")
}

impl HttpFilterPlugin for OAuth2Filter {
    fn filter_type(&self) -> FilterType {
        FilterType::OAuth2
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        for route in &listener.routes {
            let Some(oidc) = route.oidc() else {
                continue;
            };
            let name = per_route_filter_name(FilterType::OAuth2, &route.name);
            if hcm_contains_filter(hcm, &name) {
                continue;
            }
            // Invalid settings are reported by `patch_route`, which also drops the route.
            match build_oauth2(&route.name, oidc) {
                Ok(config) => hcm.http_filters.push(disabled_filter(name, OAUTH2_TYPE_URL, &config)),
                Err(err) => debug!(route = %route.name, error = %err, "Skipping OAuth2 filter"),
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
        let Some(oidc) = ir_route.oidc() else {
            return Ok(());
        };
        build_oauth2(&ir_route.name, oidc)?;
        enable_filter_on_route(route, &per_route_filter_name(FilterType::OAuth2, &ir_route.name))
    }

    fn patch_resources(
        &self,
        table: &mut ResourceTable,
        routes: &[HttpRoute],
    ) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new();
        for route in routes {
            let Some(oidc) = route.oidc() else {
                continue;
            };
            if build_oauth2(&route.name, oidc).is_err() {
                continue;
            }

            let cluster = token_endpoint_cluster(&oidc.provider.token_endpoint).and_then(|c| {
                add_url_cluster(table, &c, &token_endpoint_cluster_name(&c.hostname))
            });
            if let Err(err) = cluster {
                errors.push(err.for_route(&route.name));
            }

            let client_secret =
                generic_secret(client_secret_name(&route.name), oidc.client_secret.clone().into_bytes());
            if let Err(err) = table.add_shared(client_secret) {
                errors.push(err.for_route(&route.name));
            }

            // Generated keys are random, so a route seen twice keeps its first key.
            let hmac_name = hmac_secret_name(&route.name);
            if table.contains::<Secret>(&hmac_name) {
                debug!(secret = %hmac_name, "HMAC secret already registered");
                continue;
            }
            errors.absorb(table.add(self.hmac_secret(&route.name)));
        }
        errors.into_result()
    }
}

/// The token endpoint is always reached over TLS, on 443 unless the URL
/// names a port.
fn token_endpoint_cluster(token_endpoint: &str) -> crate::Result<UrlCluster> {
    let url = Url::parse(token_endpoint)
        .map_err(|e| invalid_config(format!("invalid token endpoint '{token_endpoint}': {e}")))?;
    let mut cluster = url_to_cluster(token_endpoint)?;
    cluster.port = url.port().map(u32::from).unwrap_or(DEFAULT_TOKEN_ENDPOINT_PORT);
    cluster.tls = true;
    Ok(cluster)
}

fn exact_path(path: &str) -> PathMatcher {
    PathMatcher {
        rule: Some(Rule::Path(StringMatcher {
            match_pattern: Some(MatchPattern::Exact(path.to_string())),
            ignore_case: false,
            ..Default::default()
        })),
        ..Default::default()
    }
}

pub fn build_oauth2(route: &str, oidc: &Oidc) -> crate::Result<OAuth2> {
    if oidc.client_id.trim().is_empty() {
        return Err(invalid_config("OIDC client id cannot be empty"));
    }
    if oidc.provider.authorization_endpoint.trim().is_empty() {
        return Err(invalid_config("OIDC provider requires an authorization endpoint"));
    }
    let token_cluster = token_endpoint_cluster(&oidc.provider.token_endpoint)
        .map_err(|e| Error::config(format!("OIDC token endpoint: {e}")))?;

    let config = OAuth2ConfigProto {
        token_endpoint: Some(HttpUri {
            uri: oidc.provider.token_endpoint.clone(),
            http_upstream_type: Some(HttpUpstreamType::Cluster(token_endpoint_cluster_name(
                &token_cluster.hostname,
            ))),
            timeout: Some(duration_from_secs(TOKEN_ENDPOINT_TIMEOUT_SECS)),
            ..Default::default()
        }),
        authorization_endpoint: oidc.provider.authorization_endpoint.clone(),
        credentials: Some(OAuth2Credentials {
            client_id: oidc.client_id.clone(),
            token_secret: Some(sds_secret_config(client_secret_name(route))),
            token_formation: Some(TokenFormation::HmacSecret(sds_secret_config(hmac_secret_name(
                route,
            )))),
            ..Default::default()
        }),
        redirect_uri: REDIRECT_URI.to_string(),
        redirect_path_matcher: Some(exact_path(REDIRECT_PATH)),
        signout_path: Some(exact_path(SIGNOUT_PATH)),
        forward_bearer_token: true,
        auth_scopes: oidc.scopes.clone(),
        auth_type: AuthType::BasicAuth as i32,
        ..Default::default()
    };

    Ok(OAuth2 { config: Some(config), ..Default::default() })
}
