//! # Translator Settings
//!
//! Defines the knobs a translator is built with.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;
use validator::Validate;

use crate::errors::{Error, Result};
use crate::xds::filters::http::{FilterPosition, FilterType};

/// Environment variable toggling the route matcher compiler
pub const ENV_ROUTE_MATCHER: &str = "XDS_TRANSLATOR_ROUTE_MATCHER";
/// Environment variable naming the global rate limit service
pub const ENV_RATELIMIT_URL: &str = "XDS_TRANSLATOR_RATELIMIT_URL";

/// Settings shared by every translation run of a [`crate::Translator`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct TranslatorSettings {
    /// Compile virtual hosts into matcher trees instead of linear route lists
    pub route_matcher: bool,

    /// Custom repositioning applied after the priority sort
    pub filter_order: Vec<FilterPosition>,

    /// External rate limit service; global rate limits are ignored without it
    #[validate(nested)]
    pub global_rate_limit: Option<GlobalRateLimitSettings>,

    /// Size in bytes of generated OIDC HMAC keys
    #[validate(range(min = 16, max = 64, message = "HMAC secret length must be between 16 and 64 bytes"))]
    pub hmac_secret_length: usize,
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self {
            route_matcher: true,
            filter_order: Vec::new(),
            global_rate_limit: None,
            hmac_secret_length: 32,
        }
    }
}

/// Rate limit service reached over gRPC
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct GlobalRateLimitSettings {
    /// `grpc://host:port`, or `grpcs://` for TLS
    #[validate(url(message = "Rate limit service URL must be a valid URL"))]
    pub service_url: String,

    /// Reject requests when the service cannot be reached
    #[serde(default)]
    pub failure_mode_deny: bool,

    /// Per-request timeout of calls to the service
    #[serde(default)]
    #[validate(range(min = 1, message = "Rate limit timeout must be positive"))]
    pub timeout_ms: Option<u64>,
}

impl GlobalRateLimitSettings {
    pub fn new(service_url: impl Into<String>) -> Self {
        Self { service_url: service_url.into(), failure_mode_deny: false, timeout_ms: None }
    }
}

impl TranslatorSettings {
    /// Load settings from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let settings: Self = serde_yaml::from_str(&raw)?;
        Ok(settings)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup`.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if let Some(raw) = lookup(ENV_ROUTE_MATCHER) {
            self.route_matcher = parse_bool(&raw).ok_or_else(|| {
                Error::config(format!("{ENV_ROUTE_MATCHER} must be a boolean, got '{raw}'"))
            })?;
        }

        if let Some(url) = lookup(ENV_RATELIMIT_URL).filter(|u| !u.trim().is_empty()) {
            match self.global_rate_limit.as_mut() {
                Some(global) => global.service_url = url,
                None => self.global_rate_limit = Some(GlobalRateLimitSettings::new(url)),
            }
        }
        Ok(self)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        for position in &self.filter_order {
            validate_position(position)?;
        }

        if let Some(global) = &self.global_rate_limit {
            let url = Url::parse(&global.service_url)
                .map_err(|e| Error::config(format!("invalid rate limit service URL: {e}")))?;
            if url.host_str().is_none() || url.port().is_none() {
                return Err(Error::config(
                    "rate limit service URL must name a host and a port",
                ));
            }
        }
        Ok(())
    }
}

fn validate_position(position: &FilterPosition) -> Result<()> {
    let anchor = match (position.before, position.after) {
        (Some(anchor), None) | (None, Some(anchor)) => anchor,
        _ => {
            return Err(Error::config(format!(
                "filter position for '{}' must set exactly one of 'before' or 'after'",
                position.name
            )))
        }
    };
    if anchor == position.name {
        return Err(Error::config(format!("filter '{}' cannot be positioned relative to itself", position.name)));
    }
    if position.name == FilterType::Router || anchor == FilterType::Router {
        return Err(Error::config("the router filter always ends the chain and cannot be repositioned"));
    }
    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
