//! Listener building for HTTP and TCP IR listeners.
//!
//! Listeners are keyed by socket. An HTTP listener owns either the default
//! filter chain (plaintext) or an SNI-matched chain (TLS) holding an HTTP
//! connection manager whose routes arrive over RDS. The connection manager is
//! stored encoded inside the chain, so patching it means decode, modify and
//! re-encode.

use envoy_types::pb::envoy::config::core::v3::{
    transport_socket::ConfigType as TransportSocketConfigType, TransportSocket,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter, listener_filter, Filter, FilterChain, FilterChainMatch, Listener, ListenerFilter,
};
use envoy_types::pb::envoy::extensions::filters::listener::proxy_protocol::v3::ProxyProtocol;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier, UpgradeConfig},
    HttpConnectionManager, Rds,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    tcp_proxy::ClusterSpecifier, TcpProxy,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, DownstreamTlsContext,
};
use envoy_types::pb::google::protobuf::BoolValue;
use prost::Message;

use crate::errors::{Error, Result};
use crate::ir::{HttpListener, TlsCertificate};
use crate::xds::cluster::{socket_address, TLS_TRANSPORT_SOCKET};
use crate::xds::filters::any_from_message;
use crate::xds::secret::{ads_config_source, sds_secret_config};

pub const HCM_FILTER_NAME: &str = "envoy.filters.network.http_connection_manager";
pub const TCP_PROXY_FILTER_NAME: &str = "envoy.filters.network.tcp_proxy";
pub const TLS_INSPECTOR_FILTER_NAME: &str = "envoy.filters.listener.tls_inspector";
pub const PROXY_PROTOCOL_FILTER_NAME: &str = "envoy.filters.listener.proxy_protocol";

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const PROXY_PROTOCOL_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.proxy_protocol.v3.ProxyProtocol";
const DOWNSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

const WILDCARD_HOSTNAME: &str = "*";

/// Socket listener without filter chains.
pub fn build_xds_tcp_listener(name: &str, address: &str, port: u32) -> Listener {
    Listener {
        name: name.to_string(),
        address: Some(socket_address(address, port)),
        ..Default::default()
    }
}

/// Connection manager of an HTTP listener. The filter chain is left empty
/// for the filter registry to populate.
pub fn build_hcm(listener: &HttpListener) -> HttpConnectionManager {
    let stat_prefix = if listener.tls.is_some() { "https" } else { "http" };

    let mut hcm = HttpConnectionManager {
        stat_prefix: stat_prefix.to_string(),
        codec_type: CodecType::Auto as i32,
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            config_source: Some(ads_config_source()),
            route_config_name: listener.name.clone(),
            ..Default::default()
        })),
        use_remote_address: Some(BoolValue { value: true }),
        ..Default::default()
    };

    if listener.is_http2 {
        hcm.codec_type = CodecType::Http2 as i32;
    } else {
        hcm.upgrade_configs =
            vec![UpgradeConfig { upgrade_type: "websocket".to_string(), ..Default::default() }];
    }
    hcm
}

fn hcm_filter(hcm: &HttpConnectionManager) -> Filter {
    Filter {
        name: HCM_FILTER_NAME.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(any_from_message(HCM_TYPE_URL, hcm))),
        ..Default::default()
    }
}

/// Decode the connection manager of `chain`, if it carries one.
pub fn find_hcm(chain: &FilterChain) -> Result<Option<HttpConnectionManager>> {
    let Some(filter) = chain.filters.iter().find(|f| f.name == HCM_FILTER_NAME) else {
        return Ok(None);
    };
    match &filter.config_type {
        Some(filter::ConfigType::TypedConfig(any)) => HttpConnectionManager::decode(&any.value[..])
            .map(Some)
            .map_err(|e| Error::decode("http connection manager", e)),
        _ => Err(Error::internal("http connection manager filter has no typed config")),
    }
}

/// Re-encode `hcm` in place of the connection manager of `chain`.
pub fn replace_hcm(chain: &mut FilterChain, hcm: &HttpConnectionManager) -> Result<()> {
    let slot = chain
        .filters
        .iter_mut()
        .find(|f| f.name == HCM_FILTER_NAME)
        .ok_or_else(|| Error::internal("http connection manager not found in filter chain"))?;
    *slot = hcm_filter(hcm);
    Ok(())
}

/// Name of the route configuration the default chain's connection manager
/// reads over RDS.
pub fn default_route_config_name(listener: &Listener) -> Result<Option<String>> {
    let Some(chain) = listener.default_filter_chain.as_ref() else {
        return Ok(None);
    };
    Ok(find_hcm(chain)?.and_then(|hcm| match hcm.route_specifier {
        Some(RouteSpecifier::Rds(rds)) => Some(rds.route_config_name),
        _ => None,
    }))
}

/// Attach `hcm` to `xds_listener`: as the default chain for plaintext
/// listeners, or as an SNI-matched TLS chain.
pub fn add_hcm_filter_chain(
    xds_listener: &mut Listener,
    listener: &HttpListener,
    hcm: &HttpConnectionManager,
) -> Result<()> {
    let mut chain = FilterChain {
        name: listener.name.clone(),
        filters: vec![hcm_filter(hcm)],
        ..Default::default()
    };

    match &listener.tls {
        Some(tls) => {
            chain.transport_socket = Some(downstream_tls_socket(&tls.certificates)?);
            add_server_names_match(xds_listener, &mut chain, &listener.hostnames);
            xds_listener.filter_chains.push(chain);
        }
        None => {
            if xds_listener.default_filter_chain.is_some() {
                return Err(Error::config(format!(
                    "listener '{}' already has a default filter chain",
                    xds_listener.name
                )));
            }
            xds_listener.default_filter_chain = Some(chain);
        }
    }
    Ok(())
}

/// Downstream TLS socket serving `certificates` over SDS.
pub fn downstream_tls_socket(certificates: &[TlsCertificate]) -> Result<TransportSocket> {
    if certificates.is_empty() {
        return Err(Error::config("TLS requires at least one certificate"));
    }
    let context = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_certificate_sds_secret_configs: certificates
                .iter()
                .map(|cert| sds_secret_config(cert.name.clone()))
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
            DOWNSTREAM_TLS_TYPE_URL,
            &context,
        ))),
        ..Default::default()
    })
}

/// Match `chain` on the SNI `hostnames`. Wildcard listeners match every
/// server name and need no inspector.
pub fn add_server_names_match(
    xds_listener: &mut Listener,
    chain: &mut FilterChain,
    hostnames: &[String],
) {
    match hostnames.first() {
        Some(first) if first != WILDCARD_HOSTNAME => {
            chain.filter_chain_match = Some(FilterChainMatch {
                server_names: hostnames.to_vec(),
                ..Default::default()
            });
            add_tls_inspector(xds_listener);
        }
        _ => {}
    }
}

fn listener_filter<M: Message>(name: &str, type_url: &str, msg: &M) -> ListenerFilter {
    ListenerFilter {
        name: name.to_string(),
        config_type: Some(listener_filter::ConfigType::TypedConfig(any_from_message(
            type_url, msg,
        ))),
        ..Default::default()
    }
}

/// Add a TLS inspector unless the listener already has one.
pub fn add_tls_inspector(xds_listener: &mut Listener) {
    if xds_listener.listener_filters.iter().any(|f| f.name == TLS_INSPECTOR_FILTER_NAME) {
        return;
    }
    xds_listener.listener_filters.push(listener_filter(
        TLS_INSPECTOR_FILTER_NAME,
        TLS_INSPECTOR_TYPE_URL,
        &TlsInspector::default(),
    ));
}

/// Add the proxy protocol filter ahead of every other listener filter.
pub fn patch_proxy_protocol(xds_listener: &mut Listener, enable: bool) {
    if !enable
        || xds_listener.listener_filters.iter().any(|f| f.name == PROXY_PROTOCOL_FILTER_NAME)
    {
        return;
    }
    xds_listener.listener_filters.insert(
        0,
        listener_filter(PROXY_PROTOCOL_FILTER_NAME, PROXY_PROTOCOL_TYPE_URL, &ProxyProtocol::default()),
    );
}

/// TLS handling of a TCP filter chain.
#[derive(Debug, Clone, Copy)]
pub enum TcpChainTls<'a> {
    None,
    /// Forward the encrypted stream, routing on SNI
    Passthrough { snis: &'a [String] },
    /// Terminate with the given certificates, optionally matching on SNI
    Terminate { snis: &'a [String], certificates: &'a [TlsCertificate] },
}

/// Add a `TcpProxy` chain named `name` forwarding to `cluster`.
pub fn add_tcp_filter_chain(
    xds_listener: &mut Listener,
    name: &str,
    cluster: &str,
    tls: TcpChainTls<'_>,
) -> Result<()> {
    let stat_prefix = match tls {
        TcpChainTls::Passthrough { .. } => "passthrough",
        _ => "tcp",
    };
    let proxy = TcpProxy {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(ClusterSpecifier::Cluster(cluster.to_string())),
        ..Default::default()
    };

    let mut chain = FilterChain {
        name: name.to_string(),
        filters: vec![Filter {
            name: TCP_PROXY_FILTER_NAME.to_string(),
            config_type: Some(filter::ConfigType::TypedConfig(any_from_message(
                TCP_PROXY_TYPE_URL,
                &proxy,
            ))),
            ..Default::default()
        }],
        ..Default::default()
    };

    match tls {
        TcpChainTls::None => {}
        TcpChainTls::Passthrough { snis } => {
            add_server_names_match(xds_listener, &mut chain, snis);
        }
        TcpChainTls::Terminate { snis, certificates } => {
            chain.transport_socket = Some(downstream_tls_socket(certificates)?);
            add_server_names_match(xds_listener, &mut chain, snis);
        }
    }

    xds_listener.filter_chains.push(chain);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::TlsConfig;

    fn cert(name: &str) -> TlsCertificate {
        TlsCertificate {
            name: name.to_string(),
            certificate_chain: "cert".to_string(),
            private_key: "key".to_string(),
        }
    }

    fn tls_listener(name: &str, hostnames: &[&str]) -> HttpListener {
        let mut listener = HttpListener::new(name, "0.0.0.0", 10443);
        listener.hostnames = hostnames.iter().map(|h| h.to_string()).collect();
        listener.tls = Some(TlsConfig { certificates: vec![cert(&format!("{name}-cert"))] });
        listener
    }

    #[test]
    fn hcm_uses_rds_named_after_listener() {
        let listener = HttpListener::new("default/eg/http", "0.0.0.0", 8080);
        let hcm = build_hcm(&listener);

        assert_eq!(hcm.stat_prefix, "http");
        assert_eq!(hcm.codec_type, CodecType::Auto as i32);
        assert_eq!(hcm.upgrade_configs[0].upgrade_type, "websocket");
        assert!(matches!(
            hcm.route_specifier,
            Some(RouteSpecifier::Rds(ref rds)) if rds.route_config_name == "default/eg/http"
        ));
    }

    #[test]
    fn http2_listeners_skip_websocket_upgrades() {
        let mut listener = tls_listener("grpc", &["*"]);
        listener.is_http2 = true;
        let hcm = build_hcm(&listener);

        assert_eq!(hcm.stat_prefix, "https");
        assert_eq!(hcm.codec_type, CodecType::Http2 as i32);
        assert!(hcm.upgrade_configs.is_empty());
    }

    #[test]
    fn plaintext_hcm_becomes_default_chain_once() {
        let listener = HttpListener::new("l1", "0.0.0.0", 8080);
        let mut xds = build_xds_tcp_listener("l1", "0.0.0.0", 8080);
        let hcm = build_hcm(&listener);

        add_hcm_filter_chain(&mut xds, &listener, &hcm).expect("default chain");
        assert_eq!(default_route_config_name(&xds).expect("decode"), Some("l1".to_string()));

        let err = add_hcm_filter_chain(&mut xds, &listener, &hcm).expect_err("second default");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn tls_chains_match_on_sni() {
        let listener = tls_listener("secure", &["www.example.com", "api.example.com"]);
        let mut xds = build_xds_tcp_listener("secure", "0.0.0.0", 10443);
        add_hcm_filter_chain(&mut xds, &listener, &build_hcm(&listener)).expect("tls chain");

        assert!(xds.default_filter_chain.is_none());
        let chain = &xds.filter_chains[0];
        assert_eq!(
            chain.filter_chain_match.as_ref().map(|m| m.server_names.clone()),
            Some(vec!["www.example.com".to_string(), "api.example.com".to_string()])
        );
        assert_eq!(
            chain.transport_socket.as_ref().map(|s| s.name.as_str()),
            Some(TLS_TRANSPORT_SOCKET)
        );
        assert_eq!(xds.listener_filters.len(), 1);
        assert_eq!(xds.listener_filters[0].name, TLS_INSPECTOR_FILTER_NAME);
    }

    #[test]
    fn wildcard_tls_chain_needs_no_inspector() {
        let listener = tls_listener("secure", &["*"]);
        let mut xds = build_xds_tcp_listener("secure", "0.0.0.0", 10443);
        add_hcm_filter_chain(&mut xds, &listener, &build_hcm(&listener)).expect("tls chain");

        assert!(xds.filter_chains[0].filter_chain_match.is_none());
        assert!(xds.listener_filters.is_empty());
    }

    #[test]
    fn replaced_hcm_is_decoded_back() {
        let listener = HttpListener::new("l1", "0.0.0.0", 8080);
        let mut xds = build_xds_tcp_listener("l1", "0.0.0.0", 8080);
        add_hcm_filter_chain(&mut xds, &listener, &build_hcm(&listener)).expect("chain");

        let chain = xds.default_filter_chain.as_mut().expect("default chain");
        let mut hcm = find_hcm(chain).expect("decode").expect("hcm present");
        hcm.stat_prefix = "patched".to_string();
        replace_hcm(chain, &hcm).expect("replace");

        let decoded = find_hcm(chain).expect("decode").expect("hcm present");
        assert_eq!(decoded.stat_prefix, "patched");
    }

    #[test]
    fn corrupt_hcm_is_a_decode_error() {
        let mut chain = FilterChain {
            filters: vec![Filter {
                name: HCM_FILTER_NAME.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(
                    envoy_types::pb::google::protobuf::Any {
                        type_url: HCM_TYPE_URL.to_string(),
                        value: vec![0xff, 0xff, 0xff],
                    },
                )),
            }],
            ..Default::default()
        };
        assert!(matches!(find_hcm(&chain), Err(Error::Decode { .. })));

        chain.filters.clear();
        assert!(find_hcm(&chain).expect("no hcm").is_none());
    }

    #[test]
    fn proxy_protocol_goes_first_and_only_once() {
        let mut xds = build_xds_tcp_listener("l1", "0.0.0.0", 8443);
        add_tls_inspector(&mut xds);
        patch_proxy_protocol(&mut xds, false);
        assert_eq!(xds.listener_filters.len(), 1);

        patch_proxy_protocol(&mut xds, true);
        patch_proxy_protocol(&mut xds, true);
        let names: Vec<&str> = xds.listener_filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![PROXY_PROTOCOL_FILTER_NAME, TLS_INSPECTOR_FILTER_NAME]);
    }

    #[test]
    fn tcp_chains_follow_tls_mode() {
        let mut xds = build_xds_tcp_listener("tcp", "0.0.0.0", 9000);
        let snis = vec!["db.example.com".to_string()];
        let certificates = vec![cert("db-cert")];

        add_tcp_filter_chain(&mut xds, "plain", "plain-backend", TcpChainTls::None).expect("plain");
        add_tcp_filter_chain(&mut xds, "pass", "pass-backend", TcpChainTls::Passthrough { snis: &snis })
            .expect("passthrough");
        add_tcp_filter_chain(
            &mut xds,
            "term",
            "term-backend",
            TcpChainTls::Terminate { snis: &snis, certificates: &certificates },
        )
        .expect("terminate");

        assert_eq!(xds.filter_chains.len(), 3);
        assert!(xds.filter_chains[0].filter_chain_match.is_none());
        assert!(xds.filter_chains[1].transport_socket.is_none());
        assert!(xds.filter_chains[1].filter_chain_match.is_some());
        assert!(xds.filter_chains[2].transport_socket.is_some());
        assert_eq!(xds.listener_filters.len(), 1);

        let Some(filter::ConfigType::TypedConfig(any)) = &xds.filter_chains[1].filters[0].config_type
        else {
            panic!("expected typed tcp proxy");
        };
        let proxy = TcpProxy::decode(&any.value[..]).expect("decode tcp proxy");
        assert_eq!(proxy.stat_prefix, "passthrough");
        assert_eq!(proxy.cluster_specifier, Some(ClusterSpecifier::Cluster("pass-backend".into())));
    }

    #[test]
    fn termination_without_certificates_fails() {
        let mut xds = build_xds_tcp_listener("tcp", "0.0.0.0", 9000);
        let result = add_tcp_filter_chain(
            &mut xds,
            "term",
            "backend",
            TcpChainTls::Terminate { snis: &[], certificates: &[] },
        );
        assert!(result.is_err());
        assert!(xds.filter_chains.is_empty());
    }
}
