//! Envoy xDS resource generation
//!
//! Translates the IR into the resources served to Envoy over discovery:
//! - LDS listeners with HTTP connection managers or TCP proxies
//! - RDS route configurations, optionally compiled into matcher trees
//! - CDS clusters and EDS load assignments for route destinations
//! - SDS secrets for certificates and filter credentials

pub mod cluster;
pub mod extension;
pub mod filters;
pub mod listener;
pub mod resources;
pub mod route;
pub mod route_matcher;
pub mod secret;
pub mod translator;

pub use extension::{ExtensionHooks, InjectedResources};
pub use resources::{AddOutcome, ResourceKind, ResourceTable, Snapshot, SnapshotEntry};
pub use translator::{Translation, Translator};
