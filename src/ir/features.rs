//! Per-route feature configs, one per HTTP filter family.

use serde::{Deserialize, Serialize};

use super::{RouteDestination, StringMatch};

/// Traffic-shaping features of a route.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrafficFeatures {
    pub fault_injection: Option<FaultInjection>,
    pub local_rate_limit: Option<LocalRateLimit>,
    pub global_rate_limit: Option<GlobalRateLimit>,
}

/// Authentication and authorization features of a route.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityFeatures {
    pub cors: Option<Cors>,
    pub jwt: Option<JwtAuth>,
    pub oidc: Option<Oidc>,
    pub basic_auth: Option<BasicAuth>,
    pub ext_auth: Option<ExtAuth>,
}

/// Listener-wide health check endpoint served by the proxy itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSettings {
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Cors {
    pub allow_origins: Vec<StringMatch>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age_secs: Option<u64>,
    pub allow_credentials: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FaultInjection {
    pub delay: Option<FaultDelay>,
    pub abort: Option<FaultAbort>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultDelay {
    pub fixed_delay_ms: u64,
    /// Share of requests affected, 0-100
    #[serde(default)]
    pub percentage: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FaultAbort {
    pub http_status: Option<u32>,
    pub grpc_status: Option<u32>,
    pub percentage: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl RateLimitUnit {
    pub fn as_secs(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitValue {
    pub requests: u32,
    pub unit: RateLimitUnit,
}

/// A limit that applies to requests matching every header match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitRule {
    #[serde(default)]
    pub header_matches: Vec<StringMatch>,
    pub limit: RateLimitValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalRateLimit {
    pub default: RateLimitValue,
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GlobalRateLimit {
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JwtAuth {
    pub providers: Vec<JwtProvider>,
    pub allow_missing: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JwtProvider {
    pub name: String,
    pub issuer: String,
    pub audiences: Vec<String>,
    pub remote_jwks: Option<RemoteJwks>,
    /// Inline JWKS document
    pub local_jwks: Option<String>,
    pub claim_to_headers: Vec<ClaimToHeader>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteJwks {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimToHeader {
    pub header: String,
    pub claim: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Oidc {
    pub provider: OidcProvider,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OidcProvider {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasicAuth {
    /// htpasswd formatted user list
    pub users: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtAuth {
    pub grpc: Option<GrpcExtAuthService>,
    pub http: Option<HttpExtAuthService>,
    pub failure_open: bool,
    pub headers_to_ext_auth: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrpcExtAuthService {
    pub destination: RouteDestination,
    #[serde(default)]
    pub authority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpExtAuthService {
    pub destination: RouteDestination,
    pub authority: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers_to_backend: Vec<String>,
}

impl ExtAuth {
    /// Backend destination of whichever service flavour is configured.
    pub fn destination(&self) -> Option<&RouteDestination> {
        self.grpc
            .as_ref()
            .map(|g| &g.destination)
            .or_else(|| self.http.as_ref().map(|h| &h.destination))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CompressorKind {
    Gzip,
    Brotli,
}

impl CompressorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Brotli => "brotli",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Compression {
    #[serde(rename = "type")]
    pub kind: CompressorKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialInjection {
    /// Header receiving the credential; `Authorization` when unset
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
    pub credential: String,
}
