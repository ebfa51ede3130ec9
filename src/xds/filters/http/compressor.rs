//! Response compression filters, one per algorithm.
//!
//! Filters are shared by every route of a listener and named
//! `envoy.filters.http.compressor.<algorithm>`. A route opts in with a
//! `CompressorPerRoute` override and stops forwarding `accept-encoding`
//! upstream.

use envoy_types::pb::envoy::config::core::v3::TypedExtensionConfig;
use envoy_types::pb::envoy::config::route::v3::Route;
use envoy_types::pb::envoy::extensions::compression::brotli::compressor::v3::Brotli;
use envoy_types::pb::envoy::extensions::compression::gzip::compressor::v3::Gzip;
use envoy_types::pb::envoy::extensions::filters::http::compressor::v3::{
    compressor_per_route::Override, Compressor as CompressorProto, CompressorOverrides,
    CompressorPerRoute, ResponseDirectionOverrides,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;

use super::{disabled_filter, hcm_contains_filter, set_route_filter_config, FilterType, HttpFilterPlugin};
use crate::errors::ErrorList;
use crate::ir::{CompressorKind, HttpListener, HttpRoute};
use crate::xds::filters::any_from_message;

const COMPRESSOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.compressor.v3.Compressor";
const COMPRESSOR_PER_ROUTE_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.compressor.v3.CompressorPerRoute";
const GZIP_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.compression.gzip.compressor.v3.Gzip";
const BROTLI_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.compression.brotli.compressor.v3.Brotli";
const ACCEPT_ENCODING: &str = "accept-encoding";

#[derive(Debug, Default)]
pub struct CompressorFilter;

pub fn compressor_filter_name(kind: CompressorKind) -> String {
    format!("{}.{}", FilterType::Compressor.filter_name(), kind.as_str())
}

impl HttpFilterPlugin for CompressorFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Compressor
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        for route in &listener.routes {
            for compression in &route.compression {
                let name = compressor_filter_name(compression.kind);
                if hcm_contains_filter(hcm, &name) {
                    continue;
                }
                let config = build_compressor(compression.kind);
                hcm.http_filters.push(disabled_filter(name, COMPRESSOR_TYPE_URL, &config));
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
        if ir_route.compression.is_empty() {
            return Ok(());
        }

        let per_route = CompressorPerRoute {
            r#override: Some(Override::Overrides(CompressorOverrides {
                response_direction_config: Some(ResponseDirectionOverrides::default()),
                ..Default::default()
            })),
            ..Default::default()
        };
        for compression in &ir_route.compression {
            set_route_filter_config(
                route,
                &compressor_filter_name(compression.kind),
                any_from_message(COMPRESSOR_PER_ROUTE_TYPE_URL, &per_route),
            )?;
        }

        if !route.request_headers_to_remove.iter().any(|h| h == ACCEPT_ENCODING) {
            route.request_headers_to_remove.push(ACCEPT_ENCODING.to_string());
        }
        Ok(())
    }
}

pub fn build_compressor(kind: CompressorKind) -> CompressorProto {
    let library = match kind {
        CompressorKind::Gzip => TypedExtensionConfig {
            name: "envoy.compression.gzip.compressor".to_string(),
            typed_config: Some(any_from_message(GZIP_TYPE_URL, &Gzip::default())),
            ..Default::default()
        },
        CompressorKind::Brotli => TypedExtensionConfig {
            name: "envoy.compression.brotli.compressor".to_string(),
            typed_config: Some(any_from_message(BROTLI_TYPE_URL, &Brotli::default())),
            ..Default::default()
        },
    };
    CompressorProto { compressor_library: Some(library), ..Default::default() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Compression;

    fn compressed(name: &str, kinds: &[CompressorKind]) -> HttpRoute {
        let mut route = HttpRoute::new(name);
        route.compression = kinds.iter().map(|&kind| Compression { kind }).collect();
        route
    }

    #[test]
    fn one_filter_per_algorithm() {
        let listener = HttpListener::new("l1", "0.0.0.0", 80)
            .with_route(compressed("a", &[CompressorKind::Gzip]))
            .with_route(compressed("b", &[CompressorKind::Gzip, CompressorKind::Brotli]));
        let mut hcm = HttpConnectionManager::default();
        CompressorFilter.patch_hcm(&mut hcm, &listener).expect("patch");

        let names: Vec<&str> = hcm.http_filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["envoy.filters.http.compressor.gzip", "envoy.filters.http.compressor.brotli"]
        );
        assert!(hcm.http_filters.iter().all(|f| f.disabled));
        assert!(names.iter().all(|name| FilterType::Compressor.matches(name)));
    }

    #[test]
    fn route_enables_compression_and_drops_accept_encoding() {
        let ir_route = compressed("a", &[CompressorKind::Brotli]);
        let listener = HttpListener::new("l1", "0.0.0.0", 80);
        let mut route = Route { name: "a".into(), ..Default::default() };
        CompressorFilter.patch_route(&mut route, &ir_route, &listener).expect("patch route");

        assert!(route.typed_per_filter_config.contains_key("envoy.filters.http.compressor.brotli"));
        assert_eq!(route.request_headers_to_remove, vec![ACCEPT_ENCODING.to_string()]);
    }
}
