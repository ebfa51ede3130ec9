//! # Resource Table
//!
//! Typed, append-only store for the resources produced by one translation.
//! Every kind keeps its resources in insertion order and no two resources of
//! the same kind share a name unless a merge predicate accepted a replacement.

use std::collections::BTreeMap;
use std::fmt;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::{address, socket_address, Address};
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use serde::Serialize;
use tracing::debug;

use crate::errors::{Error, Result};

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// Kinds of resources the translator produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ResourceKind {
    Listener,
    RouteConfiguration,
    Cluster,
    ClusterLoadAssignment,
    Secret,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Listener,
        ResourceKind::RouteConfiguration,
        ResourceKind::Cluster,
        ResourceKind::ClusterLoadAssignment,
        ResourceKind::Secret,
    ];

    pub fn type_url(self) -> &'static str {
        match self {
            Self::Listener => LISTENER_TYPE_URL,
            Self::RouteConfiguration => ROUTE_TYPE_URL,
            Self::Cluster => CLUSTER_TYPE_URL,
            Self::ClusterLoadAssignment => ENDPOINT_TYPE_URL,
            Self::Secret => SECRET_TYPE_URL,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listener => "Listener",
            Self::RouteConfiguration => "RouteConfiguration",
            Self::Cluster => "Cluster",
            Self::ClusterLoadAssignment => "ClusterLoadAssignment",
            Self::Secret => "Secret",
        };
        f.write_str(name)
    }
}

/// A protobuf resource that can live in a [`ResourceTable`].
pub trait XdsResource: Message + Clone + PartialEq + Sized {
    const KIND: ResourceKind;

    fn resource_name(&self) -> &str;

    #[doc(hidden)]
    fn slot(table: &ResourceTable) -> &Vec<Self>;

    #[doc(hidden)]
    fn slot_mut(table: &mut ResourceTable) -> &mut Vec<Self>;
}

macro_rules! impl_xds_resource {
    ($ty:ty, $kind:expr, $field:ident, |$r:ident| $name:expr) => {
        impl XdsResource for $ty {
            const KIND: ResourceKind = $kind;

            fn resource_name(&self) -> &str {
                let $r = self;
                $name
            }

            fn slot(table: &ResourceTable) -> &Vec<Self> {
                &table.$field
            }

            fn slot_mut(table: &mut ResourceTable) -> &mut Vec<Self> {
                &mut table.$field
            }
        }
    };
}

impl_xds_resource!(Listener, ResourceKind::Listener, listeners, |r| &r.name);
impl_xds_resource!(RouteConfiguration, ResourceKind::RouteConfiguration, route_configurations, |r| {
    &r.name
});
impl_xds_resource!(Cluster, ResourceKind::Cluster, clusters, |r| &r.name);
impl_xds_resource!(ClusterLoadAssignment, ResourceKind::ClusterLoadAssignment, endpoints, |r| {
    &r.cluster_name
});
impl_xds_resource!(Secret, ResourceKind::Secret, secrets, |r| &r.name);

/// Outcome of a registration that tolerates an existing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// No resource with that name existed; the new one was appended.
    Created,
    /// An identical resource was already registered; nothing changed.
    AlreadyExists,
    /// The merge predicate accepted the new resource in place of the old one.
    Replaced,
    /// The merge predicate kept the existing resource.
    Kept,
}

/// A resource encoded for transport.
#[derive(Debug, Clone)]
pub struct BuiltResource {
    pub name: String,
    pub resource: Any,
}

impl BuiltResource {
    pub fn into_any(self) -> Any {
        self.resource
    }

    pub fn type_url(&self) -> &str {
        &self.resource.type_url
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTable {
    listeners: Vec<Listener>,
    route_configurations: Vec<RouteConfiguration>,
    clusters: Vec<Cluster>,
    endpoints: Vec<ClusterLoadAssignment>,
    secrets: Vec<Secret>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resource, failing when one of the same kind and name exists.
    pub fn add<R: XdsResource>(&mut self, resource: R) -> Result<()> {
        if self.contains::<R>(resource.resource_name()) {
            return Err(Error::DuplicateResource {
                kind: R::KIND,
                name: resource.resource_name().to_string(),
            });
        }
        debug!(kind = %R::KIND, name = %resource.resource_name(), "Registered xDS resource");
        R::slot_mut(self).push(resource);
        Ok(())
    }

    /// Append a resource, or let `merge(existing, new)` decide whether the new
    /// resource supersedes an existing one with the same name.
    pub fn add_or_replace<R, F>(&mut self, resource: R, merge: F) -> AddOutcome
    where
        R: XdsResource,
        F: FnOnce(&R, &R) -> bool,
    {
        let slot = R::slot_mut(self);
        match slot.iter().position(|r| r.resource_name() == resource.resource_name()) {
            Some(index) => {
                if merge(&slot[index], &resource) {
                    debug!(kind = %R::KIND, name = %resource.resource_name(), "Replaced xDS resource");
                    slot[index] = resource;
                    AddOutcome::Replaced
                } else {
                    AddOutcome::Kept
                }
            }
            None => {
                slot.push(resource);
                AddOutcome::Created
            }
        }
    }

    /// Register a resource shared by several callers. An identical resource
    /// under the same name is reported as [`AddOutcome::AlreadyExists`]; a
    /// different definition is a conflict.
    pub fn add_shared<R: XdsResource>(&mut self, resource: R) -> Result<AddOutcome> {
        match self.find::<R>(resource.resource_name()) {
            Some(existing) if *existing == resource => Ok(AddOutcome::AlreadyExists),
            Some(_) => Err(Error::ResourceConflict {
                kind: R::KIND,
                name: resource.resource_name().to_string(),
            }),
            None => {
                self.add(resource)?;
                Ok(AddOutcome::Created)
            }
        }
    }

    pub fn find<R: XdsResource>(&self, name: &str) -> Option<&R> {
        R::slot(self).iter().find(|r| r.resource_name() == name)
    }

    pub fn find_mut<R: XdsResource>(&mut self, name: &str) -> Option<&mut R> {
        R::slot_mut(self).iter_mut().find(|r| r.resource_name() == name)
    }

    pub fn contains<R: XdsResource>(&self, name: &str) -> bool {
        self.find::<R>(name).is_some()
    }

    /// Resources of one kind in insertion order.
    pub fn resources<R: XdsResource>(&self) -> &[R] {
        R::slot(self)
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn route_configurations(&self) -> &[RouteConfiguration] {
        &self.route_configurations
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn endpoints(&self) -> &[ClusterLoadAssignment] {
        &self.endpoints
    }

    pub fn secrets(&self) -> &[Secret] {
        &self.secrets
    }

    /// Number of resources of the given kind.
    pub fn count(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Listener => self.listeners.len(),
            ResourceKind::RouteConfiguration => self.route_configurations.len(),
            ResourceKind::Cluster => self.clusters.len(),
            ResourceKind::ClusterLoadAssignment => self.endpoints.len(),
            ResourceKind::Secret => self.secrets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        ResourceKind::ALL.iter().all(|kind| self.count(*kind) == 0)
    }

    /// Find a TCP socket listener bound to `address:port`.
    pub fn find_listener_by_socket_mut(
        &mut self,
        address: &str,
        port: u32,
    ) -> Option<&mut Listener> {
        self.listeners.iter_mut().find(|l| listener_binds(l, address, port))
    }

    pub fn find_listener_by_socket(&self, address: &str, port: u32) -> Option<&Listener> {
        self.listeners.iter().find(|l| listener_binds(l, address, port))
    }

    /// Encode every resource of `kind` in insertion order.
    pub fn built_resources(&self, kind: ResourceKind) -> Vec<BuiltResource> {
        fn build<R: XdsResource>(resources: &[R]) -> Vec<BuiltResource> {
            resources
                .iter()
                .map(|r| BuiltResource {
                    name: r.resource_name().to_string(),
                    resource: Any { type_url: R::KIND.type_url().to_string(), value: r.encode_to_vec() },
                })
                .collect()
        }

        match kind {
            ResourceKind::Listener => build(&self.listeners),
            ResourceKind::RouteConfiguration => build(&self.route_configurations),
            ResourceKind::Cluster => build(&self.clusters),
            ResourceKind::ClusterLoadAssignment => build(&self.endpoints),
            ResourceKind::Secret => build(&self.secrets),
        }
    }

    /// Normalized view used for golden comparisons and CLI output: kind to
    /// entries sorted by name.
    pub fn snapshot(&self) -> Snapshot {
        let mut resources = BTreeMap::new();
        for kind in ResourceKind::ALL {
            let mut entries: Vec<SnapshotEntry> = self
                .built_resources(kind)
                .into_iter()
                .map(|built| SnapshotEntry {
                    size_bytes: built.resource.value.len(),
                    type_url: built.resource.type_url,
                    name: built.name,
                })
                .collect();
            if entries.is_empty() {
                continue;
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            resources.insert(kind, entries);
        }
        Snapshot { resources }
    }
}

fn listener_binds(listener: &Listener, address: &str, port: u32) -> bool {
    let Some(Address { address: Some(address::Address::SocketAddress(socket)) }) =
        listener.address.as_ref()
    else {
        return false;
    };
    socket.address == address
        && socket.protocol == socket_address::Protocol::Tcp as i32
        && matches!(
            socket.port_specifier,
            Some(socket_address::PortSpecifier::PortValue(p)) if p == port
        )
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Snapshot {
    pub resources: BTreeMap<ResourceKind, Vec<SnapshotEntry>>,
}

impl Snapshot {
    pub fn names(&self, kind: ResourceKind) -> Vec<&str> {
        self.resources
            .get(&kind)
            .map(|entries| entries.iter().map(|e| e.name.as_str()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SnapshotEntry {
    pub name: String,
    pub type_url: String,
    pub size_bytes: usize,
}
