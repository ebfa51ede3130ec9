//! Basic authentication against an inline htpasswd user list.

use envoy_types::pb::envoy::config::core::v3::{data_source::Specifier, DataSource};
use envoy_types::pb::envoy::config::route::v3::Route;
use envoy_types::pb::envoy::extensions::filters::http::basic_auth::v3::BasicAuth as BasicAuthProto;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{
    disabled_filter, enable_filter_on_route, hcm_contains_filter, per_route_filter_name,
    FilterType, HttpFilterPlugin,
};
use crate::errors::ErrorList;
use crate::ir::{BasicAuth, HttpListener, HttpRoute};
use crate::xds::filters::invalid_config;

const BASIC_AUTH_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.basic_auth.v3.BasicAuth";
/// Envoy only verifies SHA1 hashed htpasswd entries.
const SHA_PREFIX: &str = "{SHA}";

/// Base64 of a 20 byte SHA1 digest behind the `{SHA}` marker.
static SHA_HASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{SHA\}[A-Za-z0-9+/]{27}=$").expect("htpasswd hash pattern"));

#[derive(Debug, Default)]
pub struct BasicAuthFilter;

impl HttpFilterPlugin for BasicAuthFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::BasicAuth
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        for route in &listener.routes {
            let Some(basic_auth) = route.basic_auth() else {
                continue;
            };
            let name = per_route_filter_name(FilterType::BasicAuth, &route.name);
            if hcm_contains_filter(hcm, &name) {
                continue;
            }
            match build_basic_auth(basic_auth) {
                Ok(config) => hcm.http_filters.push(disabled_filter(name, BASIC_AUTH_TYPE_URL, &config)),
                Err(err) => debug!(route = %route.name, error = %err, "Skipping basic auth filter"),
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
        let Some(basic_auth) = ir_route.basic_auth() else {
            return Ok(());
        };
        build_basic_auth(basic_auth)?;
        enable_filter_on_route(route, &per_route_filter_name(FilterType::BasicAuth, &ir_route.name))
    }
}

pub fn build_basic_auth(basic_auth: &BasicAuth) -> crate::Result<BasicAuthProto> {
    let mut entries = 0;
    for line in basic_auth.users.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((user, hash)) = line.split_once(':') else {
            return Err(invalid_config(format!("malformed htpasswd entry '{line}'")));
        };
        if user.is_empty() || !SHA_HASH.is_match(hash) {
            return Err(invalid_config(format!(
                "htpasswd entry for '{user}' must use the {SHA_PREFIX} hash format"
            )));
        }
        entries += 1;
    }
    if entries == 0 {
        return Err(invalid_config("basic auth requires at least one user"));
    }

    Ok(BasicAuthProto {
        users: Some(DataSource {
            specifier: Some(Specifier::InlineBytes(basic_auth.users.clone().into_bytes())),
            ..Default::default()
        }),
        ..Default::default()
    })
}
