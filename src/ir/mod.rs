//! # Intermediate Representation
//!
//! Protocol-agnostic description of listeners, routes and backends produced by
//! the gateway reconciliation layer. The translator treats every value here as
//! read-only input.

mod features;

pub use features::*;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Root of the IR handed to a single translation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Xds {
    pub http: Vec<HttpListener>,
    pub tcp: Vec<TcpListener>,
}

impl Xds {
    /// Parse an IR document from YAML (JSON is accepted too).
    pub fn from_yaml(input: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Structural checks that must hold before any resource is produced.
    pub fn validate(&self) -> Result<()> {
        let mut http_names = HashSet::new();
        for listener in &self.http {
            if listener.name.trim().is_empty() {
                return Err(Error::precondition("http listener name cannot be empty"));
            }
            if !http_names.insert(listener.name.as_str()) {
                return Err(Error::precondition(format!(
                    "http listener '{}' is declared more than once",
                    listener.name
                )));
            }
            unique_route_names(&listener.name, listener.routes.iter().map(|r| r.name.as_str()))?;
        }

        let mut tcp_names = HashSet::new();
        for listener in &self.tcp {
            if listener.name.trim().is_empty() {
                return Err(Error::precondition("tcp listener name cannot be empty"));
            }
            if !tcp_names.insert(listener.name.as_str()) {
                return Err(Error::precondition(format!(
                    "tcp listener '{}' is declared more than once",
                    listener.name
                )));
            }
            unique_route_names(&listener.name, listener.routes.iter().map(|r| r.name.as_str()))?;
        }
        Ok(())
    }
}

fn unique_route_names<'a>(listener: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(Error::precondition(format!(
                "listener '{listener}' has a route without a name"
            )));
        }
        if !seen.insert(name) {
            return Err(Error::precondition(format!(
                "listener '{listener}' declares route '{name}' more than once"
            )));
        }
    }
    Ok(())
}

/// An HTTP listener and the routes attached to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpListener {
    pub name: String,
    pub address: String,
    pub port: u32,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub routes: Vec<HttpRoute>,
    #[serde(default)]
    pub is_http2: bool,
    #[serde(default)]
    pub enable_proxy_protocol: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheckSettings>,
}

impl HttpListener {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u32) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            hostnames: vec!["*".to_string()],
            tls: None,
            routes: Vec::new(),
            is_http2: false,
            enable_proxy_protocol: false,
            health_check: None,
        }
    }

    pub fn with_route(mut self, route: HttpRoute) -> Self {
        self.routes.push(route);
        self
    }

    /// Whether any route of this listener satisfies `predicate`.
    pub fn any_route(&self, predicate: impl Fn(&HttpRoute) -> bool) -> bool {
        self.routes.iter().any(predicate)
    }
}

/// Downstream TLS termination material for a listener.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    #[serde(default)]
    pub certificates: Vec<TlsCertificate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsCertificate {
    pub name: String,
    /// PEM encoded certificate chain
    pub certificate_chain: String,
    /// PEM encoded private key
    pub private_key: String,
}

fn wildcard_hostname() -> String {
    "*".to_string()
}

/// A single HTTP route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpRoute {
    pub name: String,
    #[serde(default = "wildcard_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub path_match: Option<StringMatch>,
    #[serde(default)]
    pub header_matches: Vec<StringMatch>,
    #[serde(default)]
    pub query_param_matches: Vec<StringMatch>,
    #[serde(default)]
    pub destination: Option<RouteDestination>,
    #[serde(default)]
    pub direct_response: Option<DirectResponse>,
    #[serde(default)]
    pub redirect: Option<Redirect>,
    #[serde(default)]
    pub add_request_headers: Vec<AddHeader>,
    #[serde(default)]
    pub remove_request_headers: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub traffic: Option<TrafficFeatures>,
    #[serde(default)]
    pub security: Option<SecurityFeatures>,
    #[serde(default)]
    pub compression: Vec<Compression>,
    #[serde(default)]
    pub credential_injection: Option<CredentialInjection>,
}

impl HttpRoute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: wildcard_hostname(),
            path_match: None,
            header_matches: Vec::new(),
            query_param_matches: Vec::new(),
            destination: None,
            direct_response: None,
            redirect: None,
            add_request_headers: Vec::new(),
            remove_request_headers: Vec::new(),
            timeout_ms: None,
            traffic: None,
            security: None,
            compression: Vec::new(),
            credential_injection: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_path(mut self, path: StringMatch) -> Self {
        self.path_match = Some(path);
        self
    }

    pub fn with_destination(mut self, destination: RouteDestination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn fault(&self) -> Option<&FaultInjection> {
        self.traffic.as_ref().and_then(|t| t.fault_injection.as_ref())
    }

    pub fn local_rate_limit(&self) -> Option<&LocalRateLimit> {
        self.traffic.as_ref().and_then(|t| t.local_rate_limit.as_ref())
    }

    pub fn global_rate_limit(&self) -> Option<&GlobalRateLimit> {
        self.traffic.as_ref().and_then(|t| t.global_rate_limit.as_ref())
    }

    pub fn cors(&self) -> Option<&Cors> {
        self.security.as_ref().and_then(|s| s.cors.as_ref())
    }

    pub fn jwt(&self) -> Option<&JwtAuth> {
        self.security.as_ref().and_then(|s| s.jwt.as_ref())
    }

    pub fn oidc(&self) -> Option<&Oidc> {
        self.security.as_ref().and_then(|s| s.oidc.as_ref())
    }

    pub fn basic_auth(&self) -> Option<&BasicAuth> {
        self.security.as_ref().and_then(|s| s.basic_auth.as_ref())
    }

    pub fn ext_auth(&self) -> Option<&ExtAuth> {
        self.security.as_ref().and_then(|s| s.ext_auth.as_ref())
    }
}

/// String matcher used for paths, headers and query parameters. Exactly one
/// pattern field must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StringMatch {
    /// Header or query parameter name; unused for path matches
    pub name: String,
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub contains: Option<String>,
    pub safe_regex: Option<String>,
    pub invert: bool,
}

impl StringMatch {
    pub fn exact(value: impl Into<String>) -> Self {
        Self { exact: Some(value.into()), ..Default::default() }
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        Self { prefix: Some(value.into()), ..Default::default() }
    }

    pub fn regex(value: impl Into<String>) -> Self {
        Self { safe_regex: Some(value.into()), ..Default::default() }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        let set = [
            self.exact.is_some(),
            self.prefix.is_some(),
            self.suffix.is_some(),
            self.contains.is_some(),
            self.safe_regex.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if set != 1 {
            return Err(Error::config(format!(
                "string match '{}' must set exactly one pattern, found {set}",
                self.name
            )));
        }
        if let Some(pattern) = &self.safe_regex {
            regex::Regex::new(pattern).map_err(|e| {
                Error::config(format!("invalid regex '{pattern}' in string match: {e}"))
            })?;
        }
        Ok(())
    }
}

/// Backends a route forwards to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteDestination {
    pub name: String,
    #[serde(default)]
    pub settings: Vec<DestinationSetting>,
}

impl RouteDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), settings: Vec::new() }
    }

    pub fn with_setting(mut self, setting: DestinationSetting) -> Self {
        self.settings.push(setting);
        self
    }

    /// A destination with no endpoints cannot back a cluster.
    pub fn has_endpoints(&self) -> bool {
        self.settings.iter().any(|s| !s.endpoints.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestinationSetting {
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub protocol: AppProtocol,
    #[serde(default)]
    pub address_type: Option<AddressType>,
    #[serde(default)]
    pub endpoints: Vec<DestinationEndpoint>,
    #[serde(default)]
    pub tls: Option<UpstreamTls>,
}

impl DestinationSetting {
    pub fn endpoints(endpoints: Vec<DestinationEndpoint>) -> Self {
        Self {
            weight: None,
            protocol: AppProtocol::Http,
            address_type: None,
            endpoints,
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationEndpoint {
    pub host: String,
    pub port: u32,
}

impl DestinationEndpoint {
    pub fn new(host: impl Into<String>, port: u32) -> Self {
        Self { host: host.into(), port }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppProtocol {
    #[default]
    Http,
    Http2,
    Grpc,
    Tcp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    Ip,
    Fqdn,
}

/// Upstream TLS origination settings of a destination setting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamTls {
    pub sni: Option<String>,
    /// PEM encoded CA bundle used to verify the upstream
    pub ca_certificate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectResponse {
    pub status_code: u32,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Redirect {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub path: Option<String>,
    pub port: Option<u32>,
    pub status_code: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddHeader {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub append: bool,
}

/// A TCP listener and the routes attached to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpListener {
    pub name: String,
    pub address: String,
    pub port: u32,
    #[serde(default)]
    pub enable_proxy_protocol: bool,
    #[serde(default)]
    pub routes: Vec<TcpRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpRoute {
    pub name: String,
    pub destination: RouteDestination,
    #[serde(default)]
    pub tls: Option<TcpRouteTls>,
}

/// TLS handling of a TCP route: SNI passthrough, or termination when
/// certificates are given.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TcpRouteTls {
    pub snis: Vec<String>,
    pub certificates: Vec<TlsCertificate>,
}

impl TcpRouteTls {
    pub fn terminates(&self) -> bool {
        !self.certificates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
http:
  - name: default/eg/http
    address: 0.0.0.0
    port: 8080
    routes:
      - name: login
        path_match: { exact: /login }
        destination:
          name: login-backend
          settings:
            - endpoints: [{ host: 10.0.0.1, port: 8080 }]
      - name: api
        hostname: api.example.com
        path_match: { prefix: /api/ }
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let ir = Xds::from_yaml(SAMPLE).expect("parse ir");
        assert_eq!(ir.http.len(), 1);
        let listener = &ir.http[0];
        assert!(listener.tls.is_none());
        assert_eq!(listener.routes[0].hostname, "*");
        assert_eq!(listener.routes[1].hostname, "api.example.com");
        assert_eq!(
            listener.routes[0].destination.as_ref().map(|d| d.settings[0].protocol),
            Some(AppProtocol::Http)
        );
        ir.validate().expect("valid ir");
    }

    #[test]
    fn duplicate_route_names_are_a_precondition_failure() {
        let ir = Xds {
            http: vec![HttpListener::new("l1", "0.0.0.0", 80)
                .with_route(HttpRoute::new("r1"))
                .with_route(HttpRoute::new("r1"))],
            tcp: vec![],
        };
        let err = ir.validate().expect_err("duplicate route");
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn string_match_requires_exactly_one_pattern() {
        assert!(StringMatch::exact("/a").validate().is_ok());
        assert!(StringMatch::default().validate().is_err());

        let mut both = StringMatch::exact("/a");
        both.prefix = Some("/b".into());
        assert!(both.validate().is_err());

        assert!(StringMatch::regex("(").validate().is_err());
    }

    #[test]
    fn destination_without_endpoints_is_detected() {
        let empty = RouteDestination::new("d").with_setting(DestinationSetting::endpoints(vec![]));
        assert!(!empty.has_endpoints());
        let live = RouteDestination::new("d").with_setting(DestinationSetting::endpoints(vec![
            DestinationEndpoint::new("10.0.0.1", 80),
        ]));
        assert!(live.has_endpoints());
    }
}
