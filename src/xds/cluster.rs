//! Cluster building for route destinations and URL-derived backends.
//!
//! Destinations with IP endpoints become EDS clusters whose endpoints travel
//! as a separate `ClusterLoadAssignment`; FQDN endpoints become STRICT_DNS
//! clusters carrying their load assignment inline. Every cluster is
//! registered with [`ResourceTable::add_shared`] because several routes (and
//! several filters) routinely point at the same backend.

use std::collections::HashMap;
use std::net::IpAddr;

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    common_lb_config::{LocalityConfigSpecifier, LocalityWeightedLbConfig},
    ClusterDiscoveryType, CommonLbConfig, DiscoveryType, DnsLookupFamily, EdsClusterConfig,
    LbPolicy, TransportSocketMatch,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::{
    address, data_source::Specifier, socket_address::{PortSpecifier, Protocol},
    transport_socket::ConfigType as TransportSocketConfigType, Address, DataSource,
    Http2ProtocolOptions, Locality, Metadata, SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context::{CombinedCertificateValidationContext, ValidationContextType},
    subject_alt_name_matcher::SanType, CertificateValidationContext, CommonTlsContext, Secret,
    SubjectAltNameMatcher, UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::explicit_http_config::ProtocolConfig;
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options::{ExplicitHttpConfig, UpstreamProtocolOptions},
    HttpProtocolOptions as UpstreamHttpProtocolOptionsV3,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::google::protobuf::{value, Any, Struct as ProstStruct, UInt32Value, Value as ProstValue};
use tracing::debug;
use url::{Host, Url};

use crate::errors::{Error, Result};
use crate::ir::{AddressType, AppProtocol, DestinationEndpoint, DestinationSetting, RouteDestination, UpstreamTls};
use crate::xds::filters::{any_from_message, duration_from_secs};
use crate::xds::resources::{AddOutcome, ResourceTable};
use crate::xds::secret::{ads_config_source, sds_secret_config, validation_context_secret, SYSTEM_TRUST_BUNDLE};

pub const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
pub const UPSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
pub const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";
const TRANSPORT_SOCKET_MATCH_KEY: &str = "envoy.transport_socket_match";

/// Name of the placeholder cluster backing TCP listeners without routes.
pub const EMPTY_CLUSTER_NAME: &str = "EmptyCluster";

const CONNECT_TIMEOUT_SECS: i64 = 10;
const DNS_REFRESH_RATE_SECS: i64 = 30;
const DEFAULT_HTTP_PORT: u32 = 80;
const DEFAULT_HTTPS_PORT: u32 = 443;

/// How the proxy discovers the endpoints of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    /// IP endpoints delivered over EDS
    Static,
    /// Hostnames resolved by the proxy
    Dns,
}

impl EndpointType {
    /// Endpoint type of a destination. Settings never mix address types, so
    /// the first setting decides; without an explicit type the endpoint hosts
    /// are inspected.
    pub fn of_settings(settings: &[DestinationSetting]) -> Self {
        let Some(first) = settings.first() else {
            return Self::Static;
        };
        match first.address_type {
            Some(AddressType::Fqdn) => Self::Dns,
            Some(AddressType::Ip) => Self::Static,
            None if first.endpoints.iter().all(|ep| ep.host.parse::<IpAddr>().is_ok()) => {
                Self::Static
            }
            None => Self::Dns,
        }
    }
}

/// Everything needed to build one upstream cluster.
#[derive(Debug, Clone)]
pub struct ClusterArgs {
    pub name: String,
    pub settings: Vec<DestinationSetting>,
    pub endpoint_type: EndpointType,
    /// Cluster-wide transport socket, used when no setting carries TLS
    pub transport_socket: Option<TransportSocket>,
}

impl ClusterArgs {
    pub fn for_destination(destination: &RouteDestination) -> Self {
        Self {
            name: destination.name.clone(),
            endpoint_type: EndpointType::of_settings(&destination.settings),
            settings: destination.settings.clone(),
            transport_socket: None,
        }
    }
}

/// A cluster together with the resources it references.
#[derive(Debug, Clone)]
pub struct ClusterResources {
    pub cluster: Cluster,
    /// Present for EDS clusters
    pub load_assignment: Option<ClusterLoadAssignment>,
    /// Upstream CA bundles referenced over SDS
    pub secrets: Vec<Secret>,
}

pub fn build_cluster(args: &ClusterArgs) -> Result<ClusterResources> {
    if args.name.trim().is_empty() {
        return Err(Error::config("cluster name cannot be empty"));
    }
    if args.settings.is_empty() {
        return Err(Error::config(format!("cluster '{}' has no destination settings", args.name)));
    }

    let mut cluster = Cluster {
        name: args.name.clone(),
        connect_timeout: Some(duration_from_secs(CONNECT_TIMEOUT_SECS)),
        lb_policy: LbPolicy::LeastRequest as i32,
        dns_lookup_family: DnsLookupFamily::V4Preferred as i32,
        common_lb_config: Some(CommonLbConfig {
            locality_config_specifier: Some(LocalityConfigSpecifier::LocalityWeightedLbConfig(
                LocalityWeightedLbConfig::default(),
            )),
            ..Default::default()
        }),
        ignore_health_on_host_removal: true,
        transport_socket: args.transport_socket.clone(),
        ..Default::default()
    };

    let mut secrets = Vec::new();
    for (index, setting) in args.settings.iter().enumerate() {
        let Some(tls) = &setting.tls else {
            continue;
        };
        let match_name = transport_socket_match_name(&args.name, index);
        let ca_secret = format!("{match_name}/ca");
        secrets.push(validation_context_secret(&ca_secret, tls.ca_certificate.as_deref()));
        cluster.transport_socket_matches.push(TransportSocketMatch {
            name: match_name.clone(),
            r#match: Some(match_name_struct(&match_name)),
            transport_socket: Some(upstream_tls_socket_with_ca(tls, &ca_secret)),
            ..Default::default()
        });
    }

    if args
        .settings
        .iter()
        .any(|s| matches!(s.protocol, AppProtocol::Http2 | AppProtocol::Grpc))
    {
        cluster.typed_extension_protocol_options = create_http2_typed_extension_protocol_options();
    }

    let load_assignment = build_load_assignment(&args.name, &args.settings)?;
    let load_assignment = match args.endpoint_type {
        EndpointType::Static => {
            cluster.cluster_discovery_type =
                Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
            cluster.eds_cluster_config = Some(EdsClusterConfig {
                service_name: args.name.clone(),
                eds_config: Some(ads_config_source()),
                ..Default::default()
            });
            Some(load_assignment)
        }
        EndpointType::Dns => {
            cluster.cluster_discovery_type =
                Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32));
            cluster.dns_refresh_rate = Some(duration_from_secs(DNS_REFRESH_RATE_SECS));
            cluster.respect_dns_ttl = true;
            cluster.load_assignment = Some(load_assignment);
            None
        }
    };

    Ok(ClusterResources { cluster, load_assignment, secrets })
}

/// Build a cluster and register it with its load assignment and secrets.
///
/// The returned outcome is the cluster's: [`AddOutcome::AlreadyExists`] when
/// an identical cluster was registered earlier by another route or filter.
pub fn add_xds_cluster(table: &mut ResourceTable, args: &ClusterArgs) -> Result<AddOutcome> {
    let ClusterResources { cluster, load_assignment, secrets } = build_cluster(args)?;

    let outcome = table.add_shared(cluster)?;
    if let Some(load_assignment) = load_assignment {
        table.add_shared(load_assignment)?;
    }
    for secret in secrets {
        table.add_shared(secret)?;
    }

    match outcome {
        AddOutcome::AlreadyExists => debug!(cluster = %args.name, "Reusing shared cluster"),
        _ => debug!(
            cluster = %args.name,
            endpoint_type = ?args.endpoint_type,
            settings = args.settings.len(),
            "Added cluster"
        ),
    }
    Ok(outcome)
}

fn build_load_assignment(
    cluster_name: &str,
    settings: &[DestinationSetting],
) -> Result<ClusterLoadAssignment> {
    let endpoints = settings
        .iter()
        .enumerate()
        .map(|(index, setting)| {
            let metadata = setting
                .tls
                .as_ref()
                .map(|_| transport_socket_metadata(&transport_socket_match_name(cluster_name, index)));
            let lb_endpoints = setting
                .endpoints
                .iter()
                .map(|endpoint| lb_endpoint(endpoint, metadata.clone()))
                .collect::<Result<Vec<_>>>()?;

            Ok(LocalityLbEndpoints {
                locality: Some(Locality {
                    region: format!("{cluster_name}/backend/{index}"),
                    ..Default::default()
                }),
                lb_endpoints,
                load_balancing_weight: Some(UInt32Value { value: setting.weight.unwrap_or(1) }),
                ..Default::default()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ClusterLoadAssignment { cluster_name: cluster_name.to_string(), endpoints, ..Default::default() })
}

fn lb_endpoint(endpoint: &DestinationEndpoint, metadata: Option<Metadata>) -> Result<LbEndpoint> {
    if endpoint.host.trim().is_empty() {
        return Err(Error::config("endpoint host cannot be empty"));
    }
    if endpoint.port == 0 || endpoint.port > 65_535 {
        return Err(Error::config(format!(
            "endpoint {}:{} has a port outside 1-65535",
            endpoint.host, endpoint.port
        )));
    }

    Ok(LbEndpoint {
        host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
            address: Some(socket_address(&endpoint.host, endpoint.port)),
            ..Default::default()
        })),
        metadata,
        load_balancing_weight: Some(UInt32Value { value: 1 }),
        ..Default::default()
    })
}

/// TCP socket address.
pub fn socket_address(host: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(port)),
            protocol: Protocol::Tcp as i32,
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn transport_socket_match_name(cluster_name: &str, index: usize) -> String {
    format!("{cluster_name}/tls/{index}")
}

fn match_name_struct(match_name: &str) -> ProstStruct {
    ProstStruct {
        fields: [(
            "name".to_string(),
            ProstValue { kind: Some(value::Kind::StringValue(match_name.to_string())) },
        )]
        .into_iter()
        .collect(),
    }
}

fn transport_socket_metadata(match_name: &str) -> Metadata {
    Metadata {
        filter_metadata: [(TRANSPORT_SOCKET_MATCH_KEY.to_string(), match_name_struct(match_name))]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

fn create_http2_typed_extension_protocol_options() -> HashMap<String, Any> {
    let http_protocol_options = UpstreamHttpProtocolOptionsV3 {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                    Http2ProtocolOptions::default(),
                )),
                ..Default::default()
            },
        )),
        ..Default::default()
    };

    let mut options = HashMap::new();
    options.insert(
        HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
        any_from_message(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &http_protocol_options),
    );
    options
}

fn tls_transport_socket(context: &UpstreamTlsContext) -> TransportSocket {
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
            UPSTREAM_TLS_TYPE_URL,
            context,
        ))),
        ..Default::default()
    }
}

/// Upstream TLS verified against a CA delivered over SDS, matching the SNI
/// against the certificate's DNS SANs.
fn upstream_tls_socket_with_ca(tls: &UpstreamTls, ca_secret: &str) -> TransportSocket {
    let mut default_validation_context = CertificateValidationContext::default();
    if let Some(sni) = &tls.sni {
        default_validation_context.match_typed_subject_alt_names = vec![SubjectAltNameMatcher {
            san_type: SanType::Dns as i32,
            matcher: Some(StringMatcher {
                match_pattern: Some(MatchPattern::Exact(sni.clone())),
                ignore_case: false,
                ..Default::default()
            }),
            ..Default::default()
        }];
    }

    let context = UpstreamTlsContext {
        sni: tls.sni.clone().unwrap_or_default(),
        common_tls_context: Some(CommonTlsContext {
            validation_context_type: Some(ValidationContextType::CombinedValidationContext(
                CombinedCertificateValidationContext {
                    default_validation_context: Some(default_validation_context),
                    validation_context_sds_secret_config: Some(sds_secret_config(ca_secret)),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }),
        ..Default::default()
    };
    tls_transport_socket(&context)
}

/// Upstream TLS with SNI, verified against the proxy's system trust bundle.
pub fn upstream_tls_socket(sni: &str) -> TransportSocket {
    let context = UpstreamTlsContext {
        sni: sni.to_string(),
        common_tls_context: Some(CommonTlsContext {
            validation_context_type: Some(ValidationContextType::ValidationContext(
                CertificateValidationContext {
                    trusted_ca: Some(DataSource {
                        specifier: Some(Specifier::Filename(SYSTEM_TRUST_BUNDLE.to_string())),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }),
        ..Default::default()
    };
    tls_transport_socket(&context)
}

/// Backend addressed by a URL (JWKS endpoints, token endpoints, external
/// services).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlCluster {
    pub name: String,
    pub hostname: String,
    pub port: u32,
    pub endpoint_type: EndpointType,
    pub tls: bool,
}

/// Derive the cluster of a backend URL: `<host with . replaced by _>_<port>`.
pub fn url_to_cluster(raw: &str) -> Result<UrlCluster> {
    let url = Url::parse(raw).map_err(|e| Error::config(format!("invalid URL '{raw}': {e}")))?;
    let tls = url.scheme() == "https";

    let (hostname, endpoint_type) = match url.host() {
        Some(Host::Ipv4(ip)) => (ip.to_string(), EndpointType::Static),
        Some(Host::Ipv6(ip)) => (ip.to_string(), EndpointType::Dns),
        Some(Host::Domain(domain)) => (domain.to_string(), EndpointType::Dns),
        None => return Err(Error::config(format!("URL '{raw}' has no host"))),
    };
    let port = url
        .port()
        .map(u32::from)
        .unwrap_or(if tls { DEFAULT_HTTPS_PORT } else { DEFAULT_HTTP_PORT });

    Ok(UrlCluster { name: cluster_name(&hostname, port), hostname, port, endpoint_type, tls })
}

pub fn cluster_name(host: &str, port: u32) -> String {
    format!("{}_{}", host.replace('.', "_"), port)
}

/// Register the cluster behind a URL, with SNI-verified TLS for `https`.
pub fn add_cluster_from_url(table: &mut ResourceTable, raw: &str) -> Result<UrlCluster> {
    let url_cluster = url_to_cluster(raw)?;
    add_url_cluster(table, &url_cluster, &url_cluster.name)?;
    Ok(url_cluster)
}

/// Register a URL-derived backend under an explicit cluster name.
pub fn add_url_cluster(
    table: &mut ResourceTable,
    url_cluster: &UrlCluster,
    name: &str,
) -> Result<AddOutcome> {
    let mut setting = DestinationSetting::endpoints(vec![DestinationEndpoint::new(
        url_cluster.hostname.clone(),
        url_cluster.port,
    )]);
    setting.weight = Some(1);
    setting.address_type = Some(match url_cluster.endpoint_type {
        EndpointType::Static => AddressType::Ip,
        EndpointType::Dns => AddressType::Fqdn,
    });

    let args = ClusterArgs {
        name: name.to_string(),
        settings: vec![setting],
        endpoint_type: url_cluster.endpoint_type,
        transport_socket: url_cluster.tls.then(|| upstream_tls_socket(&url_cluster.hostname)),
    };
    add_xds_cluster(table, &args)
}

/// Static cluster without endpoints.
pub fn empty_cluster(name: &str) -> Cluster {
    Cluster {
        name: name.to_string(),
        connect_timeout: Some(duration_from_secs(CONNECT_TIMEOUT_SECS)),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Static as i32)),
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}
