//! # Translation Pipeline
//!
//! Walks the IR and fills a fresh [`ResourceTable`]. HTTP listeners sharing a
//! socket share its connection manager and route configuration (plaintext)
//! or get their own SNI-matched chain (TLS). Each route is built, patched by
//! the filter registry and handed to the route matcher compiler; destinations
//! with endpoints become clusters; filter side resources are registered once
//! per listener.
//!
//! Translation is best effort: route- and filter-level failures are collected
//! in [`Translation::errors`] next to whatever was produced. Only structural
//! failures abort the call.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::{Route, RouteConfiguration, VirtualHost};
use tracing::{debug, info, warn};

use crate::config::TranslatorSettings;
use crate::errors::{Error, ErrorList, Result};
use crate::ir::{HttpListener, StringMatch, TcpListener, Xds};
use crate::xds::cluster::{add_xds_cluster, empty_cluster, ClusterArgs, EMPTY_CLUSTER_NAME};
use crate::xds::extension::{
    record_hook_result, replace_same_name, ExtensionHooks, POST_HTTP_LISTENER_HOOK,
    POST_ROUTE_HOOK, POST_TRANSLATE_HOOK, POST_VIRTUAL_HOST_HOOK,
};
use crate::xds::filters::http::FilterRegistry;
use crate::xds::listener::{
    add_hcm_filter_chain, add_tcp_filter_chain, build_hcm, build_xds_tcp_listener,
    default_route_config_name, find_hcm, patch_proxy_protocol, replace_hcm, TcpChainTls,
};
use crate::xds::resources::{ResourceKind, ResourceTable};
use crate::xds::route::{build_xds_route, new_route_configuration, virtual_host_name};
use crate::xds::route_matcher::build_virtual_host_matcher;
use crate::xds::secret::tls_certificate_secret;
use crate::{listener_span, translate_span};

/// Output of one translation call.
#[derive(Debug, Default)]
pub struct Translation {
    pub table: ResourceTable,
    /// Non-fatal failures; the table holds everything else
    pub errors: ErrorList,
}

impl Translation {
    pub fn has_errors(&self) -> bool {
        self.errors.has_any()
    }

    pub fn into_parts(self) -> (ResourceTable, ErrorList) {
        (self.table, self.errors)
    }
}

/// Translates IR into xDS resources. Built once and reused: every call owns
/// its own table, so concurrent calls need no synchronisation.
#[derive(Debug)]
pub struct Translator {
    settings: TranslatorSettings,
    registry: FilterRegistry,
    extension: Option<Box<dyn ExtensionHooks>>,
}

impl Translator {
    pub fn new(settings: TranslatorSettings) -> Self {
        let registry = FilterRegistry::new(&settings);
        Self { settings, registry, extension: None }
    }

    /// Replace the built-in filter registry.
    pub fn with_registry(mut self, registry: FilterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_extension(mut self, hooks: impl ExtensionHooks + 'static) -> Self {
        self.extension = Some(Box::new(hooks));
        self
    }

    pub fn settings(&self) -> &TranslatorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// Translate `ir` into a fresh resource table.
    ///
    /// Returns `Err` only for structural failures (invalid IR, undecodable
    /// payloads, internal inconsistencies); no resources are returned then.
    pub fn translate(&self, ir: &Xds) -> Result<Translation> {
        let span = translate_span!(ir.http.len(), ir.tcp.len());
        let _enter = span.enter();

        ir.validate()?;

        let mut table = ResourceTable::new();
        let mut errors = ErrorList::new();

        for listener in &ir.http {
            errors.absorb_list(self.process_http_listener(&mut table, listener));
        }
        for listener in &ir.tcp {
            errors.absorb_list(self.process_tcp_listener(&mut table, listener));
        }

        if let Some(hooks) = self.extension.as_deref() {
            notify_http_listeners(hooks, &mut table, &ir.http, &mut errors);
            let injected = hooks.post_translate(table.clusters(), table.secrets());
            if let Some(injected) = record_hook_result(hooks, POST_TRANSLATE_HOOK, injected, &mut errors) {
                injected.apply(&mut table);
            }
        }

        if let Some(fatal) = errors.take_fatal() {
            return Err(fatal);
        }

        info!(
            listeners = table.count(ResourceKind::Listener),
            route_configurations = table.count(ResourceKind::RouteConfiguration),
            clusters = table.count(ResourceKind::Cluster),
            secrets = table.count(ResourceKind::Secret),
            errors = errors.len(),
            "Translation complete"
        );
        Ok(Translation { table, errors })
    }

    fn process_http_listener(
        &self,
        table: &mut ResourceTable,
        listener: &HttpListener,
    ) -> std::result::Result<(), ErrorList> {
        let span = listener_span!("http", listener.name, port = listener.port);
        let _enter = span.enter();

        let mut errors = ErrorList::new();
        let existing_route_config = match self.attach_hcm(table, listener, &mut errors) {
            Ok(name) => name,
            Err(err) => {
                errors.push(err.for_listener(&listener.name));
                return errors.into_result();
            }
        };

        if let Some(tls) = &listener.tls {
            for cert in &tls.certificates {
                let secret = tls_certificate_secret(cert).and_then(|s| table.add_shared(s));
                errors.absorb(secret.map_err(|e| e.for_listener(&listener.name)));
            }
        }

        let route_config_name = match existing_route_config {
            Some(name) if table.contains::<RouteConfiguration>(&name) => name,
            Some(name) => {
                errors.push(
                    Error::internal(format!("unable to find route configuration '{name}'"))
                        .for_listener(&listener.name),
                );
                return errors.into_result();
            }
            None => {
                let created = table.add(new_route_configuration(&listener.name));
                if errors.absorb(created.map_err(|e| e.for_listener(&listener.name))).is_none() {
                    return errors.into_result();
                }
                listener.name.clone()
            }
        };

        let virtual_hosts = self.build_virtual_hosts(table, listener, &mut errors);
        match table.find_mut::<RouteConfiguration>(&route_config_name) {
            Some(route_config) => route_config.virtual_hosts.extend(virtual_hosts),
            None => errors.push(Error::internal(format!(
                "route configuration '{route_config_name}' disappeared during translation"
            ))),
        }

        errors.absorb_list(self.registry.patch_resources(table, &listener.routes));
        errors.into_result()
    }

    /// Find or create the socket listener of `listener` and make sure a
    /// connection manager serves it. Returns the route configuration to
    /// reuse when the listener shares an existing plaintext chain.
    fn attach_hcm(
        &self,
        table: &mut ResourceTable,
        listener: &HttpListener,
        errors: &mut ErrorList,
    ) -> Result<Option<String>> {
        let Some(xds_listener) = table.find_listener_by_socket_mut(&listener.address, listener.port)
        else {
            let mut xds_listener =
                build_xds_tcp_listener(&listener.name, &listener.address, listener.port);
            patch_proxy_protocol(&mut xds_listener, listener.enable_proxy_protocol);
            self.add_new_hcm(&mut xds_listener, listener, errors)?;
            table.add(xds_listener)?;
            debug!(listener = %listener.name, "Created listener");
            return Ok(None);
        };

        patch_proxy_protocol(xds_listener, listener.enable_proxy_protocol);
        if listener.tls.is_some() {
            self.add_new_hcm(xds_listener, listener, errors)?;
            debug!(listener = %listener.name, socket = %xds_listener.name, "Added TLS filter chain");
            return Ok(None);
        }

        match default_route_config_name(xds_listener)? {
            Some(route_config_name) => {
                let chain = xds_listener
                    .default_filter_chain
                    .as_mut()
                    .ok_or_else(|| Error::internal("default filter chain vanished"))?;
                let mut hcm = find_hcm(chain)?
                    .ok_or_else(|| Error::internal("http connection manager vanished"))?;
                errors.absorb_list(
                    self.registry
                        .patch_hcm(&mut hcm, listener)
                        .map_err(|list| list.into_iter().map(|e| e.for_listener(&listener.name)).collect()),
                );
                replace_hcm(chain, &hcm)?;
                debug!(
                    listener = %listener.name,
                    route_config = %route_config_name,
                    "Sharing plaintext filter chain"
                );
                Ok(Some(route_config_name))
            }
            None => {
                self.add_new_hcm(xds_listener, listener, errors)?;
                Ok(None)
            }
        }
    }

    fn add_new_hcm(
        &self,
        xds_listener: &mut Listener,
        listener: &HttpListener,
        errors: &mut ErrorList,
    ) -> Result<()> {
        let mut hcm = build_hcm(listener);
        errors.absorb_list(
            self.registry
                .patch_hcm(&mut hcm, listener)
                .map_err(|list| list.into_iter().map(|e| e.for_listener(&listener.name)).collect()),
        );
        add_hcm_filter_chain(xds_listener, listener, &hcm)
    }

    /// One virtual host per route hostname, in first-seen order. Failing
    /// routes are left out and recorded.
    fn build_virtual_hosts(
        &self,
        table: &mut ResourceTable,
        listener: &HttpListener,
        errors: &mut ErrorList,
    ) -> Vec<VirtualHost> {
        let mut hosts: Vec<(VirtualHost, Vec<(Option<&StringMatch>, Route)>)> = Vec::new();
        let mut by_hostname: HashMap<&str, usize> = HashMap::new();

        for ir_route in &listener.routes {
            let index = *by_hostname.entry(ir_route.hostname.as_str()).or_insert_with(|| {
                hosts.push((
                    VirtualHost {
                        name: virtual_host_name(&listener.name, &ir_route.hostname),
                        domains: vec![ir_route.hostname.clone()],
                        ..Default::default()
                    },
                    Vec::new(),
                ));
                hosts.len() - 1
            });

            let mut route = match build_xds_route(ir_route, listener, &self.registry) {
                Ok(route) => route,
                Err(route_errors) => {
                    debug!(route = %ir_route.name, errors = route_errors.len(), "Skipping route");
                    errors.extend(route_errors);
                    continue;
                }
            };

            if let Some(hooks) = self.extension.as_deref() {
                let result = hooks
                    .post_route(&mut route, &hosts[index].0.domains, ir_route)
                    .map_err(|e| e.for_route(&ir_route.name));
                record_hook_result(hooks, POST_ROUTE_HOOK, result, errors);
            }
            hosts[index].1.push((ir_route.path_match.as_ref(), route));

            match &ir_route.destination {
                Some(destination) if destination.has_endpoints() => {
                    let added = add_xds_cluster(table, &ClusterArgs::for_destination(destination));
                    errors.absorb(added.map_err(|e| e.for_route(&ir_route.name)));
                }
                Some(destination) => {
                    debug!(route = %ir_route.name, destination = %destination.name, "Destination has no endpoints");
                }
                None => {}
            }
        }

        hosts
            .into_iter()
            .map(|(mut virtual_host, routes)| {
                self.attach_routes(&mut virtual_host, routes);
                if let Some(hooks) = self.extension.as_deref() {
                    let result = hooks.post_virtual_host(&mut virtual_host);
                    record_hook_result(hooks, POST_VIRTUAL_HOST_HOOK, result, errors);
                }
                virtual_host
            })
            .collect()
    }

    fn attach_routes(&self, virtual_host: &mut VirtualHost, routes: Vec<(Option<&StringMatch>, Route)>) {
        if self.settings.route_matcher {
            let matcher =
                build_virtual_host_matcher(routes.iter().map(|(path, route)| (*path, route.clone())));
            if let Some(matcher) = matcher {
                debug!(virtual_host = %virtual_host.name, routes = routes.len(), "Compiled route matcher");
                virtual_host.matcher = Some(matcher);
                return;
            }
        }
        virtual_host.routes = routes.into_iter().map(|(_, route)| route).collect();
    }

    fn process_tcp_listener(
        &self,
        table: &mut ResourceTable,
        listener: &TcpListener,
    ) -> std::result::Result<(), ErrorList> {
        let span = listener_span!("tcp", listener.name, port = listener.port);
        let _enter = span.enter();

        let mut errors = ErrorList::new();
        if table.find_listener_by_socket(&listener.address, listener.port).is_none() {
            let created =
                table.add(build_xds_tcp_listener(&listener.name, &listener.address, listener.port));
            if errors.absorb(created.map_err(|e| e.for_listener(&listener.name))).is_none() {
                return errors.into_result();
            }
        }

        let mut chains = Vec::with_capacity(listener.routes.len().max(1));
        for route in &listener.routes {
            let destination = &route.destination;
            if destination.has_endpoints() {
                let added = add_xds_cluster(table, &ClusterArgs::for_destination(destination));
                if errors.absorb(added.map_err(|e| e.for_route(&route.name))).is_none() {
                    continue;
                }
            }
            if let Some(tls) = route.tls.as_ref().filter(|tls| tls.terminates()) {
                for cert in &tls.certificates {
                    let secret = tls_certificate_secret(cert).and_then(|s| table.add_shared(s));
                    errors.absorb(secret.map_err(|e| e.for_route(&route.name)));
                }
            }
            chains.push(route);
        }

        if listener.routes.is_empty() {
            errors.absorb(table.add_shared(empty_cluster(EMPTY_CLUSTER_NAME)));
        }

        let Some(xds_listener) = table.find_listener_by_socket_mut(&listener.address, listener.port)
        else {
            errors.push(Error::internal(format!("listener '{}' vanished", listener.name)));
            return errors.into_result();
        };
        patch_proxy_protocol(xds_listener, listener.enable_proxy_protocol);

        for route in chains {
            let tls = match &route.tls {
                Some(tls) if tls.terminates() => {
                    TcpChainTls::Terminate { snis: &tls.snis, certificates: &tls.certificates }
                }
                Some(tls) => TcpChainTls::Passthrough { snis: &tls.snis },
                None => TcpChainTls::None,
            };
            let added = add_tcp_filter_chain(xds_listener, &route.name, &route.destination.name, tls);
            errors.absorb(added.map_err(|e| e.for_route(&route.name)));
        }

        if listener.routes.is_empty() {
            let added =
                add_tcp_filter_chain(xds_listener, EMPTY_CLUSTER_NAME, EMPTY_CLUSTER_NAME, TcpChainTls::None);
            errors.absorb(added.map_err(|e| e.for_listener(&listener.name)));
        }
        errors.into_result()
    }
}

/// Offer every socket listener serving HTTP to the extension, once.
fn notify_http_listeners(
    hooks: &dyn ExtensionHooks,
    table: &mut ResourceTable,
    listeners: &[HttpListener],
    errors: &mut ErrorList,
) {
    let mut notified: Vec<String> = Vec::new();
    for ir_listener in listeners {
        let Some(xds_listener) = table.find_listener_by_socket(&ir_listener.address, ir_listener.port)
        else {
            continue;
        };
        if notified.contains(&xds_listener.name) {
            continue;
        }
        notified.push(xds_listener.name.clone());

        let result = hooks.post_http_listener(xds_listener);
        if let Some(Some(modified)) = record_hook_result(hooks, POST_HTTP_LISTENER_HOOK, result, errors) {
            if modified.name != xds_listener.name {
                warn!(
                    listener = %xds_listener.name,
                    returned = %modified.name,
                    "Extension returned a listener under a different name"
                );
            }
            replace_same_name(table, modified);
        }
    }
}
