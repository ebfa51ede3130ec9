//! JWT authentication filter.
//!
//! A listener carries a single `jwt_authn` filter holding the providers of
//! every route, keyed `<route>/<provider>`, plus one named requirement per
//! route. Routes select their requirement through a `PerRouteConfig`.

use std::collections::{HashMap, HashSet};

use envoy_types::pb::envoy::config::core::v3::{
    data_source::Specifier, http_uri::HttpUpstreamType, DataSource, HttpUri,
};
use envoy_types::pb::envoy::config::route::v3::Route;
use envoy_types::pb::envoy::extensions::filters::http::jwt_authn::v3::{
    jwt_provider::{JwksSourceSpecifier, NormalizePayload},
    jwt_requirement::RequiresType,
    per_route_config::RequirementSpecifier,
    JwksAsyncFetch, JwtAuthentication, JwtClaimToHeader, JwtProvider, JwtRequirement,
    JwtRequirementOrList, PerRouteConfig, RemoteJwks,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::google::protobuf::{Any, Empty};
use prost::Message;
use tracing::debug;

use super::{
    hcm_contains_filter, set_route_filter_config, typed_filter_from_any, FilterType, HttpFilterPlugin,
};
use crate::errors::{Error, ErrorList};
use crate::ir::{HttpListener, HttpRoute, JwtAuth, JwtProvider as IrJwtProvider};
use crate::xds::cluster::{add_cluster_from_url, url_to_cluster};
use crate::xds::filters::{any_from_message, append_sorted_entries, duration_from_secs, invalid_config};
use crate::xds::resources::ResourceTable;

pub const JWT_AUTHN_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.jwt_authn.v3.JwtAuthentication";
const PER_ROUTE_CONFIG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.jwt_authn.v3.PerRouteConfig";
const JWKS_FETCH_TIMEOUT_SECS: i64 = 10;
const JWKS_CACHE_DURATION_SECS: i64 = 300;

#[derive(Debug, Default)]
pub struct JwtAuthnFilter;

fn route_jwt(route: &HttpRoute) -> Option<&JwtAuth> {
    route.jwt().filter(|jwt| !jwt.providers.is_empty())
}

pub fn provider_key(route: &str, provider: &str) -> String {
    format!("{route}/{provider}")
}

impl HttpFilterPlugin for JwtAuthnFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::JwtAuthn
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        let name = FilterType::JwtAuthn.filter_name();
        if !listener.any_route(|route| route_jwt(route).is_some()) || hcm_contains_filter(hcm, name) {
            return Ok(());
        }

        // Rejected routes are reported by `patch_route`, which also drops them.
        let (config, skipped) = build_jwt_authentication(listener);
        for err in skipped.iter() {
            debug!(error = %err, "Skipping JWT requirement");
        }
        let config = Any { type_url: JWT_AUTHN_TYPE_URL.to_string(), value: jwt_authentication_bytes(&config) };
        hcm.http_filters.push(typed_filter_from_any(name, config));
        Ok(())
    }

    fn patch_route(
        &self,
        route: &mut Route,
        ir_route: &HttpRoute,
        _listener: &HttpListener,
    ) -> crate::Result<()> {
        let Some(jwt) = route_jwt(ir_route) else {
            return Ok(());
        };
        // The listener filter has no requirement for a route it rejected.
        build_route_providers(&ir_route.name, jwt)?;
        let per_route = PerRouteConfig {
            requirement_specifier: Some(RequirementSpecifier::RequirementName(
                ir_route.name.clone(),
            )),
            ..Default::default()
        };
        set_route_filter_config(
            route,
            FilterType::JwtAuthn.filter_name(),
            any_from_message(PER_ROUTE_CONFIG_TYPE_URL, &per_route),
        )
    }

    fn patch_resources(
        &self,
        table: &mut ResourceTable,
        routes: &[HttpRoute],
    ) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new();
        for route in routes {
            let Some(jwt) = route_jwt(route) else {
                continue;
            };
            if build_route_providers(&route.name, jwt).is_err() {
                continue;
            }
            for remote in jwt.providers.iter().filter_map(|p| p.remote_jwks.as_ref()) {
                if let Err(err) = add_cluster_from_url(table, &remote.uri) {
                    errors.push(err.for_route(&route.name));
                }
            }
        }
        errors.into_result()
    }
}

/// Providers and requirements of every route on `listener`. Routes with an
/// invalid provider are left out and reported.
pub fn build_jwt_authentication(listener: &HttpListener) -> (JwtAuthentication, ErrorList) {
    let mut providers = HashMap::new();
    let mut requirement_map = HashMap::new();
    let mut errors = ErrorList::new();

    for route in &listener.routes {
        let Some(jwt) = route_jwt(route) else {
            continue;
        };
        match build_route_providers(&route.name, jwt) {
            Ok((route_providers, requirement)) => {
                providers.extend(route_providers);
                requirement_map.insert(route.name.clone(), requirement);
            }
            Err(err) => errors.push(err.for_route(&route.name)),
        }
    }

    (JwtAuthentication { providers, requirement_map, ..Default::default() }, errors)
}

/// Wire form of `config` with providers and requirements in name order.
pub fn jwt_authentication_bytes(config: &JwtAuthentication) -> Vec<u8> {
    let mut rest = config.clone();
    let providers = std::mem::take(&mut rest.providers);
    let requirements = std::mem::take(&mut rest.requirement_map);
    let mut buf = rest.encode_to_vec();
    append_sorted_entries(&mut buf, providers, |c: &mut JwtAuthentication| &mut c.providers);
    append_sorted_entries(&mut buf, requirements, |c: &mut JwtAuthentication| &mut c.requirement_map);
    buf
}

fn build_route_providers(
    route: &str,
    jwt: &JwtAuth,
) -> crate::Result<(Vec<(String, JwtProvider)>, JwtRequirement)> {
    let mut seen = HashSet::new();
    let mut providers = Vec::with_capacity(jwt.providers.len());
    let mut requirements = Vec::with_capacity(jwt.providers.len() + 1);

    for provider in &jwt.providers {
        if provider.name.trim().is_empty() {
            return Err(invalid_config("JWT provider name cannot be empty"));
        }
        if !seen.insert(provider.name.as_str()) {
            return Err(invalid_config(format!("duplicate JWT provider '{}'", provider.name)));
        }
        let key = provider_key(route, &provider.name);
        requirements.push(JwtRequirement {
            requires_type: Some(RequiresType::ProviderName(key.clone())),
            ..Default::default()
        });
        providers.push((key, build_provider(provider)?));
    }

    if jwt.allow_missing {
        requirements.push(JwtRequirement {
            requires_type: Some(RequiresType::AllowMissing(Empty::default())),
            ..Default::default()
        });
    }

    let requirement = if requirements.len() == 1 {
        requirements.remove(0)
    } else {
        JwtRequirement {
            requires_type: Some(RequiresType::RequiresAny(JwtRequirementOrList {
                requirements,
                ..Default::default()
            })),
            ..Default::default()
        }
    };
    Ok((providers, requirement))
}

fn build_provider(provider: &IrJwtProvider) -> crate::Result<JwtProvider> {
    let jwks = match (&provider.local_jwks, &provider.remote_jwks) {
        (Some(local), _) => JwksSourceSpecifier::LocalJwks(DataSource {
            specifier: Some(Specifier::InlineString(local.clone())),
            ..Default::default()
        }),
        (None, Some(remote)) => {
            let cluster = url_to_cluster(&remote.uri).map_err(|e| {
                Error::config(format!("JWT provider '{}' remote JWKS: {e}", provider.name))
            })?;
            JwksSourceSpecifier::RemoteJwks(RemoteJwks {
                http_uri: Some(HttpUri {
                    uri: remote.uri.clone(),
                    http_upstream_type: Some(HttpUpstreamType::Cluster(cluster.name)),
                    timeout: Some(duration_from_secs(JWKS_FETCH_TIMEOUT_SECS)),
                    ..Default::default()
                }),
                cache_duration: Some(duration_from_secs(JWKS_CACHE_DURATION_SECS)),
                async_fetch: Some(JwksAsyncFetch::default()),
                ..Default::default()
            })
        }
        (None, None) => {
            return Err(invalid_config(format!(
                "JWT provider '{}' requires a local or remote JWKS",
                provider.name
            )))
        }
    };

    Ok(JwtProvider {
        issuer: provider.issuer.clone(),
        audiences: provider.audiences.clone(),
        payload_in_metadata: provider.name.clone(),
        forward: true,
        claim_to_headers: provider
            .claim_to_headers
            .iter()
            .map(|c| JwtClaimToHeader {
                header_name: c.header.clone(),
                claim_name: c.claim.clone(),
                ..Default::default()
            })
            .collect(),
        normalize_payload_in_metadata: Some(NormalizePayload {
            space_delimited_claims: vec!["scope".to_string()],
            ..Default::default()
        }),
        jwks_source_specifier: Some(jwks),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ClaimToHeader, RemoteJwks as IrRemoteJwks, SecurityFeatures};
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;

    fn provider(name: &str, jwks_uri: &str) -> IrJwtProvider {
        IrJwtProvider {
            name: name.into(),
            issuer: "https://auth.example.com".into(),
            audiences: vec!["api".into()],
            remote_jwks: Some(IrRemoteJwks { uri: jwks_uri.into() }),
            claim_to_headers: vec![ClaimToHeader { header: "x-sub".into(), claim: "sub".into() }],
            ..Default::default()
        }
    }

    fn protected(name: &str, providers: Vec<IrJwtProvider>, allow_missing: bool) -> HttpRoute {
        let mut route = HttpRoute::new(name);
        route.security = Some(SecurityFeatures {
            jwt: Some(JwtAuth { providers, allow_missing }),
            ..Default::default()
        });
        route
    }

    fn listener() -> HttpListener {
        HttpListener::new("l1", "0.0.0.0", 443)
            .with_route(protected(
                "r1",
                vec![provider("example", "https://auth.example.com/jwks.json")],
                false,
            ))
            .with_route(protected(
                "r2",
                vec![provider("example", "https://auth.example.com/jwks.json")],
                true,
            ))
            .with_route(HttpRoute::new("public"))
    }

    #[test]
    fn single_filter_keys_providers_by_route() {
        let mut hcm = HttpConnectionManager::default();
        JwtAuthnFilter.patch_hcm(&mut hcm, &listener()).expect("patch");
        JwtAuthnFilter.patch_hcm(&mut hcm, &listener()).expect("idempotent");
        assert_eq!(hcm.http_filters.len(), 1);

        let (config, errors) = build_jwt_authentication(&listener());
        assert!(errors.is_empty());
        let mut keys: Vec<&str> = config.providers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["r1/example", "r2/example"]);
        assert!(matches!(
            config.requirement_map["r1"].requires_type,
            Some(RequiresType::ProviderName(ref name)) if name == "r1/example"
        ));
        assert!(matches!(
            config.requirement_map["r2"].requires_type,
            Some(RequiresType::RequiresAny(ref list)) if list.requirements.len() == 2
        ));
    }

    #[test]
    fn remote_jwks_points_at_url_cluster() {
        let (config, _) = build_jwt_authentication(&listener());
        let Some(JwksSourceSpecifier::RemoteJwks(remote)) =
            config.providers["r1/example"].jwks_source_specifier.clone()
        else {
            panic!("remote jwks");
        };
        assert_eq!(
            remote.http_uri.and_then(|u| u.http_upstream_type),
            Some(HttpUpstreamType::Cluster("auth_example_com_443".into()))
        );
    }

    #[test]
    fn jwks_clusters_are_shared() {
        let mut table = ResourceTable::new();
        JwtAuthnFilter.patch_resources(&mut table, &listener().routes).expect("resources");
        assert_eq!(table.clusters().len(), 1);
        assert!(table.contains::<Cluster>("auth_example_com_443"));
    }

    #[test]
    fn route_selects_its_requirement() {
        let listener = listener();
        let mut route = Route { name: "r1".into(), ..Default::default() };
        JwtAuthnFilter.patch_route(&mut route, &listener.routes[0], &listener).expect("patch");
        assert!(route.typed_per_filter_config.contains_key("envoy.filters.http.jwt_authn"));

        let mut public = Route { name: "public".into(), ..Default::default() };
        JwtAuthnFilter.patch_route(&mut public, &listener.routes[2], &listener).expect("patch");
        assert!(public.typed_per_filter_config.is_empty());
    }

    #[test]
    fn listener_filter_bytes_do_not_depend_on_route_order() {
        let routes: Vec<HttpRoute> = (0..8)
            .map(|i| {
                protected(&format!("r{i}"), vec![provider("idp", "https://idp.test/keys")], i % 2 == 0)
            })
            .collect();
        let listener_of = |routes: Vec<HttpRoute>| {
            routes.into_iter().fold(HttpListener::new("l1", "0.0.0.0", 443), HttpListener::with_route)
        };
        let forward = listener_of(routes.clone());
        let backward = listener_of(routes.into_iter().rev().collect());

        let (config, _) = build_jwt_authentication(&forward);
        let first = jwt_authentication_bytes(&config);
        for _ in 0..8 {
            let (again, _) = build_jwt_authentication(&backward);
            assert_eq!(jwt_authentication_bytes(&again), first);
        }
        assert_eq!(JwtAuthentication::decode(first.as_slice()).expect("decode"), config);
    }

    #[test]
    fn route_with_rejected_provider_is_not_toggled() {
        let mut broken = provider("nokeys", "https://unused");
        broken.remote_jwks = None;
        let bad = protected("bad", vec![broken], false);
        let listener = HttpListener::new("l1", "0.0.0.0", 443).with_route(bad.clone());

        let mut route = Route { name: "bad".into(), ..Default::default() };
        let err = JwtAuthnFilter.patch_route(&mut route, &bad, &listener).expect_err("invalid provider");
        assert!(err.to_string().contains("nokeys"));
        assert!(route.typed_per_filter_config.is_empty());

        let mut table = ResourceTable::new();
        JwtAuthnFilter.patch_resources(&mut table, &listener.routes).expect("resources");
        assert!(table.clusters().is_empty());
    }

    #[test]
    fn provider_without_jwks_is_a_route_error() {
        let mut broken = provider("nokeys", "https://unused");
        broken.remote_jwks = None;
        let listener = HttpListener::new("l1", "0.0.0.0", 443)
            .with_route(protected("bad", vec![broken], false))
            .with_route(protected("good", vec![provider("p", "https://idp.test/keys")], false));

        let (config, errors) = build_jwt_authentication(&listener);
        assert_eq!(errors.len(), 1);
        assert!(config.requirement_map.contains_key("good"));
        assert!(!config.requirement_map.contains_key("bad"));
    }
}
