//! Credential injector filter.
//!
//! Adds a credential header to requests of selected routes. The credential
//! itself travels as a generic secret and is referenced over SDS.

use envoy_types::pb::envoy::config::core::v3::TypedExtensionConfig;
use envoy_types::pb::envoy::config::route::v3::Route;
use envoy_types::pb::envoy::extensions::filters::http::credential_injector::v3::CredentialInjector as CredentialInjectorProto;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::envoy::extensions::http::injected_credentials::generic::v3::Generic;

use super::{
    disabled_filter, enable_filter_on_route, hcm_contains_filter, per_route_filter_name,
    FilterType, HttpFilterPlugin,
};
use crate::errors::ErrorList;
use crate::ir::{CredentialInjection, HttpListener, HttpRoute};
use crate::xds::filters::{any_from_message, invalid_config};
use crate::xds::resources::ResourceTable;
use crate::xds::secret::{add_shared_secrets, generic_secret, sds_secret_config};

const CREDENTIAL_INJECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.credential_injector.v3.CredentialInjector";
const GENERIC_CREDENTIAL_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.http.injected_credentials.generic.v3.Generic";
const GENERIC_CREDENTIAL_NAME: &str = "envoy.http.injected_credentials.generic";

#[derive(Debug, Default)]
pub struct CredentialInjectorFilter;

pub fn credential_secret_name(route: &str) -> String {
    format!("{route}/credential_injector/credential")
}

impl HttpFilterPlugin for CredentialInjectorFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::CredentialInjector
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new();
        for route in &listener.routes {
            let Some(injection) = &route.credential_injection else {
                continue;
            };
            let name = per_route_filter_name(FilterType::CredentialInjector, &route.name);
            if hcm_contains_filter(hcm, &name) {
                continue;
            }
            match build_credential_injector(&route.name, injection) {
                Ok(config) => hcm
                    .http_filters
                    .push(disabled_filter(name, CREDENTIAL_INJECTOR_TYPE_URL, &config)),
                Err(err) => errors.push(err.for_route(&route.name)),
            }
        }
        errors.into_result()
    }

    fn patch_route(
        &self,
        route: &mut Route,
        ir_route: &HttpRoute,
        _listener: &HttpListener,
    ) -> crate::Result<()> {
        if ir_route.credential_injection.is_none() {
            return Ok(());
        }
        let name = per_route_filter_name(FilterType::CredentialInjector, &ir_route.name);
        enable_filter_on_route(route, &name)
    }

    fn patch_resources(
        &self,
        table: &mut ResourceTable,
        routes: &[HttpRoute],
    ) -> Result<(), ErrorList> {
        let secrets = routes.iter().filter_map(|route| {
            route.credential_injection.as_ref().map(|injection| {
                generic_secret(
                    credential_secret_name(&route.name),
                    injection.credential.clone().into_bytes(),
                )
            })
        });
        add_shared_secrets(table, secrets)
    }
}

pub fn build_credential_injector(
    route: &str,
    injection: &CredentialInjection,
) -> crate::Result<CredentialInjectorProto> {
    if injection.credential.is_empty() {
        return Err(invalid_config("credential injection requires a credential"));
    }

    let generic = Generic {
        credential: Some(sds_secret_config(credential_secret_name(route))),
        header: injection.header.clone().filter(|h| !h.is_empty()).unwrap_or_default(),
        ..Default::default()
    };

    Ok(CredentialInjectorProto {
        overwrite: injection.overwrite,
        credential: Some(TypedExtensionConfig {
            name: GENERIC_CREDENTIAL_NAME.to_string(),
            typed_config: Some(any_from_message(GENERIC_CREDENTIAL_TYPE_URL, &generic)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;

    fn injecting(name: &str) -> HttpRoute {
        let mut route = HttpRoute::new(name);
        route.credential_injection = Some(CredentialInjection {
            header: Some("X-Api-Key".into()),
            overwrite: true,
            credential: "s3cr3t".into(),
        });
        route
    }

    #[test]
    fn filter_references_route_secret() {
        let listener = HttpListener::new("l1", "0.0.0.0", 80).with_route(injecting("r1"));
        let mut hcm = HttpConnectionManager::default();
        CredentialInjectorFilter.patch_hcm(&mut hcm, &listener).expect("patch");

        assert_eq!(hcm.http_filters.len(), 1);
        assert_eq!(hcm.http_filters[0].name, "envoy.filters.http.credential_injector/r1");
        assert!(hcm.http_filters[0].disabled);

        let config = build_credential_injector("r1", listener.routes[0].credential_injection.as_ref().expect("set"))
            .expect("config");
        assert!(config.overwrite);
    }

    #[test]
    fn secret_is_registered_per_route() {
        let mut table = ResourceTable::new();
        CredentialInjectorFilter
            .patch_resources(&mut table, &[injecting("r1"), HttpRoute::new("plain")])
            .expect("resources");
        assert!(table.contains::<Secret>("r1/credential_injector/credential"));
        assert_eq!(table.secrets().len(), 1);
    }

    #[test]
    fn empty_credential_is_rejected() {
        let mut route = injecting("r1");
        if let Some(injection) = route.credential_injection.as_mut() {
            injection.credential.clear();
        }
        let listener = HttpListener::new("l1", "0.0.0.0", 80).with_route(route);
        assert!(CredentialInjectorFilter
            .patch_hcm(&mut HttpConnectionManager::default(), &listener)
            .is_err());
    }
}
