//! # Error Types
//!
//! Error types for the xDS translator using `thiserror`.

use crate::xds::resources::ResourceKind;

/// Custom result type for translator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the translator
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed feature or filter configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Structural precondition violation; aborts a translation
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A resource with the same kind and name is already registered
    #[error("{kind} resource '{name}' already exists")]
    DuplicateResource { kind: ResourceKind, name: String },

    /// A shared resource was requested twice with different definitions
    #[error("{kind} resource '{name}' conflicts with an existing definition")]
    ResourceConflict { kind: ResourceKind, name: String },

    /// A per-route filter config was written twice for the same route
    #[error("route '{route}' already carries a per-route config for filter '{filter}'")]
    DuplicateRouteFilter { route: String, filter: String },

    /// Failure attributed to a single IR route
    #[error("route '{route}': {source}")]
    Route {
        route: String,
        #[source]
        source: Box<Error>,
    },

    /// Failure attributed to a single IR listener
    #[error("listener '{listener}': {source}")]
    Listener {
        listener: String,
        #[source]
        source: Box<Error>,
    },

    /// Extension hook failures
    #[error("Extension hook '{hook}' failed: {message}")]
    Extension { hook: &'static str, message: String },

    /// Protobuf decoding errors
    #[error("Protobuf decode error: {context}")]
    Decode {
        context: String,
        #[source]
        source: prost::DecodeError,
    },

    /// Settings validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new precondition error
    pub fn precondition<S: Into<String>>(message: S) -> Self {
        Self::Precondition(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    pub fn duplicate_route_filter(route: impl Into<String>, filter: impl Into<String>) -> Self {
        Self::DuplicateRouteFilter { route: route.into(), filter: filter.into() }
    }

    pub fn extension(hook: &'static str, message: impl Into<String>) -> Self {
        Self::Extension { hook, message: message.into() }
    }

    pub fn decode(context: impl Into<String>, source: prost::DecodeError) -> Self {
        Self::Decode { context: context.into(), source }
    }

    /// Attribute this error to an IR route. Errors already attributed to the
    /// same route are returned unchanged.
    pub fn for_route(self, route: &str) -> Self {
        if let Self::Route { route: existing, .. } = &self {
            if existing == route {
                return self;
            }
        }
        Self::Route { route: route.to_string(), source: Box::new(self) }
    }

    /// Attribute this error to an IR listener.
    pub fn for_listener(self, listener: &str) -> Self {
        if let Self::Listener { listener: existing, .. } = &self {
            if existing == listener {
                return self;
            }
        }
        Self::Listener { listener: listener.to_string(), source: Box::new(self) }
    }

    /// Whether this error aborts a translation instead of being collected.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Precondition(_) | Self::Decode { .. } | Self::Internal(_) => true,
            Self::Route { source, .. } | Self::Listener { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = Error::config("bad fault percentage");
        assert!(matches!(error, Error::Config(_)));
        assert_eq!(error.to_string(), "Configuration error: bad fault percentage");
    }

    #[test]
    fn route_attribution_is_not_nested_twice() {
        let error = Error::config("boom").for_route("r1").for_route("r1");
        assert_eq!(error.to_string(), "route 'r1': Configuration error: boom");
    }

    #[test]
    fn fatal_errors_survive_attribution() {
        assert!(Error::precondition("missing hcm").for_listener("l1").is_fatal());
        assert!(!Error::config("bad").for_route("r1").is_fatal());
        assert!(!Error::duplicate_route_filter("r1", "envoy.filters.http.cors").is_fatal());
    }

    #[test]
    fn duplicate_resource_message_names_kind() {
        let error = Error::DuplicateResource { kind: ResourceKind::Cluster, name: "c1".into() };
        assert_eq!(error.to_string(), "Cluster resource 'c1' already exists");
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: Error = io_error.into();
        assert!(matches!(error, Error::Io(_)));

        let yaml_error = serde_yaml::from_str::<Vec<u32>>("{").unwrap_err();
        let error: Error = yaml_error.into();
        assert!(matches!(error, Error::Serialization(_)));
    }
}
