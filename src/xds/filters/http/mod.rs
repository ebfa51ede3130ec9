//! HTTP filter plugins and the registry that drives them.
//!
//! Every filter family implements [`HttpFilterPlugin`]: it adds its entries to
//! a listener's connection manager, attaches per-route configuration, and
//! registers the side resources it needs. The [`FilterRegistry`] is built once
//! from [`TranslatorSettings`] and is read-only while translating.

pub mod basic_auth;
pub mod compressor;
pub mod cors;
pub mod credential_injector;
pub mod ext_authz;
pub mod fault;
pub mod health_check;
pub mod jwt_auth;
pub mod local_rate_limit;
pub mod oauth2;
pub mod ordering;
pub mod rate_limit;

use std::fmt;

use envoy_types::pb::envoy::config::route::v3::{FilterConfig, Route};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router as RouterFilter;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_filter::ConfigType as HttpFilterConfigType;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    HttpConnectionManager, HttpFilter,
};
use envoy_types::pb::google::protobuf::Any as EnvoyAny;
use prost::Message;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TranslatorSettings;
use crate::errors::{Error, ErrorList};
use crate::ir::{HttpListener, HttpRoute};
use crate::xds::filters::any_from_message;
use crate::xds::resources::ResourceTable;

pub use ordering::{filter_priority, sort_http_filters, FilterPosition};

/// Envoy's canonical router filter name
pub const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const FILTER_CONFIG_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.FilterConfig";

/// Filter families known to the ordering table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterType {
    #[serde(rename = "envoy.filters.http.health_check")]
    HealthCheck,
    #[serde(rename = "envoy.filters.http.fault")]
    Fault,
    #[serde(rename = "envoy.filters.http.cors")]
    Cors,
    #[serde(rename = "envoy.filters.http.ext_authz")]
    ExtAuthz,
    #[serde(rename = "envoy.filters.http.api_key_auth")]
    ApiKeyAuth,
    #[serde(rename = "envoy.filters.http.basic_auth")]
    BasicAuth,
    #[serde(rename = "envoy.filters.http.oauth2")]
    OAuth2,
    #[serde(rename = "envoy.filters.http.jwt_authn")]
    JwtAuthn,
    #[serde(rename = "envoy.filters.http.stateful_session")]
    StatefulSession,
    #[serde(rename = "envoy.filters.http.buffer")]
    Buffer,
    #[serde(rename = "envoy.filters.http.lua")]
    Lua,
    #[serde(rename = "envoy.filters.http.ext_proc")]
    ExtProc,
    #[serde(rename = "envoy.filters.http.wasm")]
    Wasm,
    #[serde(rename = "envoy.filters.http.rbac")]
    Rbac,
    #[serde(rename = "envoy.filters.http.local_ratelimit")]
    LocalRateLimit,
    #[serde(rename = "envoy.filters.http.ratelimit")]
    RateLimit,
    #[serde(rename = "envoy.filters.http.custom_response")]
    CustomResponse,
    #[serde(rename = "envoy.filters.http.credential_injector")]
    CredentialInjector,
    #[serde(rename = "envoy.filters.http.compressor")]
    Compressor,
    #[serde(rename = "envoy.filters.http.router")]
    Router,
}

impl FilterType {
    pub const ALL: [FilterType; 20] = [
        FilterType::HealthCheck,
        FilterType::Fault,
        FilterType::Cors,
        FilterType::ExtAuthz,
        FilterType::ApiKeyAuth,
        FilterType::BasicAuth,
        FilterType::OAuth2,
        FilterType::JwtAuthn,
        FilterType::StatefulSession,
        FilterType::Buffer,
        FilterType::Lua,
        FilterType::ExtProc,
        FilterType::Wasm,
        FilterType::Rbac,
        FilterType::LocalRateLimit,
        FilterType::RateLimit,
        FilterType::CustomResponse,
        FilterType::CredentialInjector,
        FilterType::Compressor,
        FilterType::Router,
    ];

    /// Envoy filter name of the family; generated filters extend it.
    pub fn filter_name(self) -> &'static str {
        match self {
            Self::HealthCheck => "envoy.filters.http.health_check",
            Self::Fault => "envoy.filters.http.fault",
            Self::Cors => "envoy.filters.http.cors",
            Self::ExtAuthz => "envoy.filters.http.ext_authz",
            Self::ApiKeyAuth => "envoy.filters.http.api_key_auth",
            Self::BasicAuth => "envoy.filters.http.basic_auth",
            Self::OAuth2 => "envoy.filters.http.oauth2",
            Self::JwtAuthn => "envoy.filters.http.jwt_authn",
            Self::StatefulSession => "envoy.filters.http.stateful_session",
            Self::Buffer => "envoy.filters.http.buffer",
            Self::Lua => "envoy.filters.http.lua",
            Self::ExtProc => "envoy.filters.http.ext_proc",
            Self::Wasm => "envoy.filters.http.wasm",
            Self::Rbac => "envoy.filters.http.rbac",
            Self::LocalRateLimit => "envoy.filters.http.local_ratelimit",
            Self::RateLimit => "envoy.filters.http.ratelimit",
            Self::CustomResponse => "envoy.filters.http.custom_response",
            Self::CredentialInjector => "envoy.filters.http.credential_injector",
            Self::Compressor => "envoy.filters.http.compressor",
            Self::Router => ROUTER_FILTER_NAME,
        }
    }

    /// Whether `name` is this family's filter name or one generated from it
    /// (`<type>/<suffix>`, `<type>_<suffix>`, `<type>.<suffix>`).
    pub fn matches(self, name: &str) -> bool {
        match name.strip_prefix(self.filter_name()) {
            Some(rest) => rest.is_empty() || rest.starts_with(['/', '_', '.']),
            None => false,
        }
    }

    pub fn of_filter_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|filter_type| filter_type.matches(name))
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.filter_name())
    }
}

/// Contract shared by every HTTP filter family.
pub trait HttpFilterPlugin: fmt::Debug + Send + Sync {
    fn filter_type(&self) -> FilterType;

    /// Add this family's filter entries to `hcm` when any route of `listener`
    /// needs them. Must be idempotent: entries already present are left alone.
    fn patch_hcm(&self, hcm: &mut HttpConnectionManager, listener: &HttpListener)
        -> Result<(), ErrorList>;

    /// Attach the per-route configuration of this family to `route`.
    fn patch_route(
        &self,
        route: &mut Route,
        ir_route: &HttpRoute,
        listener: &HttpListener,
    ) -> crate::Result<()>;

    /// Register clusters and secrets referenced by the filter config.
    fn patch_resources(
        &self,
        _table: &mut ResourceTable,
        _routes: &[HttpRoute],
    ) -> Result<(), ErrorList> {
        Ok(())
    }
}

/// The set of filter plugins used by a translator, plus custom ordering.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: Vec<Box<dyn HttpFilterPlugin>>,
    filter_order: Vec<FilterPosition>,
}

impl FilterRegistry {
    /// Registry holding every built-in filter family.
    pub fn new(settings: &TranslatorSettings) -> Self {
        let mut registry = Self::empty().with_filter_order(settings.filter_order.clone());
        registry.register(Box::new(health_check::HealthCheckFilter));
        registry.register(Box::new(fault::FaultFilter));
        registry.register(Box::new(cors::CorsFilter));
        registry.register(Box::new(ext_authz::ExtAuthzFilter));
        registry.register(Box::new(basic_auth::BasicAuthFilter));
        registry.register(Box::new(oauth2::OAuth2Filter::new(settings.hmac_secret_length)));
        registry.register(Box::new(jwt_auth::JwtAuthnFilter));
        registry.register(Box::new(local_rate_limit::LocalRateLimitFilter));
        registry.register(Box::new(rate_limit::RateLimitFilter::new(
            settings.global_rate_limit.clone(),
        )));
        registry.register(Box::new(compressor::CompressorFilter));
        registry.register(Box::new(credential_injector::CredentialInjectorFilter));
        registry
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_filter_order(mut self, filter_order: Vec<FilterPosition>) -> Self {
        self.filter_order = filter_order;
        self
    }

    pub fn register(&mut self, filter: Box<dyn HttpFilterPlugin>) {
        self.filters.push(filter);
    }

    pub fn filters(&self) -> impl Iterator<Item = &dyn HttpFilterPlugin> {
        self.filters.iter().map(|f| f.as_ref())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Let every plugin patch `hcm`, make sure the router is present and sort
    /// the chain. Failures of one plugin do not stop the others.
    pub fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new();
        for filter in &self.filters {
            errors.absorb_list(filter.patch_hcm(hcm, listener));
        }

        if !hcm_contains_filter(hcm, ROUTER_FILTER_NAME) {
            hcm.http_filters.push(router_filter());
        }

        let filters = std::mem::take(&mut hcm.http_filters);
        hcm.http_filters = sort_http_filters(filters, &self.filter_order);
        debug!(
            listener = %listener.name,
            filters = hcm.http_filters.len(),
            "Patched HTTP connection manager"
        );
        errors.into_result()
    }

    /// Apply every plugin's route-level patch, collecting all failures.
    pub fn patch_route(
        &self,
        route: &mut Route,
        ir_route: &HttpRoute,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new();
        for filter in &self.filters {
            errors.absorb(filter.patch_route(route, ir_route, listener));
        }
        errors.into_result()
    }

    /// Register the side resources of every plugin for `routes`.
    pub fn patch_resources(
        &self,
        table: &mut ResourceTable,
        routes: &[HttpRoute],
    ) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new();
        for filter in &self.filters {
            errors.absorb_list(filter.patch_resources(table, routes));
        }
        errors.into_result()
    }
}

pub fn hcm_contains_filter(hcm: &HttpConnectionManager, name: &str) -> bool {
    hcm.http_filters.iter().any(|filter| filter.name == name)
}

/// Name of a filter generated for one route: `<type>/<route>`.
pub fn per_route_filter_name(filter_type: FilterType, route: &str) -> String {
    format!("{}/{}", filter_type.filter_name(), route)
}

/// Filter entry carrying `msg` as its typed config.
pub fn typed_filter<M: Message>(name: impl Into<String>, type_url: &str, msg: &M) -> HttpFilter {
    typed_filter_from_any(name, any_from_message(type_url, msg))
}

pub fn typed_filter_from_any(name: impl Into<String>, config: EnvoyAny) -> HttpFilter {
    HttpFilter {
        name: name.into(),
        config_type: Some(HttpFilterConfigType::TypedConfig(config)),
        ..Default::default()
    }
}

/// Filter entry that stays inactive until a route enables it.
pub fn disabled_filter<M: Message>(name: impl Into<String>, type_url: &str, msg: &M) -> HttpFilter {
    HttpFilter { disabled: true, ..typed_filter(name, type_url, msg) }
}

pub fn router_filter() -> HttpFilter {
    typed_filter(ROUTER_FILTER_NAME, ROUTER_TYPE_URL, &RouterFilter::default())
}

/// Write a per-route override for `filter_name`. A second write for the same
/// name is reported instead of overwriting the first.
pub fn set_route_filter_config(
    route: &mut Route,
    filter_name: &str,
    config: EnvoyAny,
) -> crate::Result<()> {
    if route.typed_per_filter_config.contains_key(filter_name) {
        return Err(Error::duplicate_route_filter(route.name.clone(), filter_name));
    }
    route.typed_per_filter_config.insert(filter_name.to_string(), config);
    Ok(())
}

/// Enable a filter that is disabled at the listener level for this route.
pub fn enable_filter_on_route(route: &mut Route, filter_name: &str) -> crate::Result<()> {
    let marker = FilterConfig { config: Some(EnvoyAny::default()), ..Default::default() };
    set_route_filter_config(route, filter_name, any_from_message(FILTER_CONFIG_TYPE_URL, &marker))
}
