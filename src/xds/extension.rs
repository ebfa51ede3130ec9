//! Extension hooks invoked while a translation is assembled.
//!
//! Third-party extensions observe and modify routes, virtual hosts and
//! listeners as they are built, and may inject extra resources once the
//! translation is done. Injected resources go through
//! [`ResourceTable::add_or_replace`], so a resource with an existing name
//! supersedes the translated one instead of duplicating it.

use std::fmt;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::{Route, RouteConfiguration, VirtualHost};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use tracing::{debug, warn};

use crate::errors::{Error, ErrorList, Result};
use crate::ir::HttpRoute;
use crate::xds::resources::{AddOutcome, ResourceTable, XdsResource};

/// Hook names used in errors and logs.
pub const POST_ROUTE_HOOK: &str = "post_route";
pub const POST_VIRTUAL_HOST_HOOK: &str = "post_virtual_host";
pub const POST_HTTP_LISTENER_HOOK: &str = "post_http_listener";
pub const POST_TRANSLATE_HOOK: &str = "post_translate";

/// Callbacks an extension may implement. Every method defaults to a no-op.
pub trait ExtensionHooks: fmt::Debug + Send + Sync {
    /// Called for each route once the filter plugins have patched it.
    /// `domains` are the domains of the virtual host receiving the route.
    fn post_route(&self, _route: &mut Route, _domains: &[String], _ir_route: &HttpRoute) -> Result<()> {
        Ok(())
    }

    /// Called for each virtual host once all its routes are built.
    fn post_virtual_host(&self, _virtual_host: &mut VirtualHost) -> Result<()> {
        Ok(())
    }

    /// Called once per HTTP socket listener. A returned listener replaces
    /// the translated listener of the same name.
    fn post_http_listener(&self, _listener: &Listener) -> Result<Option<Listener>> {
        Ok(None)
    }

    /// Called once the whole translation is assembled.
    fn post_translate(&self, _clusters: &[Cluster], _secrets: &[Secret]) -> Result<InjectedResources> {
        Ok(InjectedResources::default())
    }

    /// Hook failures are logged instead of reported when true.
    fn fail_open(&self) -> bool {
        false
    }
}

/// Resources handed back by [`ExtensionHooks::post_translate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InjectedResources {
    pub clusters: Vec<Cluster>,
    pub secrets: Vec<Secret>,
    pub listeners: Vec<Listener>,
    pub route_configurations: Vec<RouteConfiguration>,
}

impl InjectedResources {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
            && self.secrets.is_empty()
            && self.listeners.is_empty()
            && self.route_configurations.is_empty()
    }

    /// Add every resource to `table`, replacing same-named ones.
    pub fn apply(self, table: &mut ResourceTable) {
        inject(table, self.clusters);
        inject(table, self.secrets);
        inject(table, self.listeners);
        inject(table, self.route_configurations);
    }
}

fn inject<R: XdsResource>(table: &mut ResourceTable, resources: Vec<R>) {
    for resource in resources {
        let name = resource.resource_name().to_string();
        let outcome = replace_same_name(table, resource);
        debug!(kind = %R::KIND, name = %name, outcome = ?outcome, "Applied extension resource");
    }
}

/// Register `resource`, superseding any resource of the same name.
pub fn replace_same_name<R: XdsResource>(table: &mut ResourceTable, resource: R) -> AddOutcome {
    table.add_or_replace(resource, |existing, new| existing.resource_name() == new.resource_name())
}

/// Record the outcome of a hook: fail-open extensions only log.
pub fn record_hook_result<T>(
    hooks: &dyn ExtensionHooks,
    hook: &'static str,
    result: Result<T>,
    errors: &mut ErrorList,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) if hooks.fail_open() => {
            warn!(hook, error = %err, "Extension hook failed, continuing (fail open)");
            None
        }
        Err(err) => {
            let err = match err {
                Error::Extension { .. } => err,
                other => Error::extension(hook, other.to_string()),
            };
            errors.push(err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::cluster::empty_cluster;
    use tracing_test::traced_test;

    #[derive(Debug)]
    struct Failing {
        fail_open: bool,
    }

    impl ExtensionHooks for Failing {
        fn post_virtual_host(&self, _virtual_host: &mut VirtualHost) -> Result<()> {
            Err(Error::config("extension rejected virtual host"))
        }

        fn fail_open(&self) -> bool {
            self.fail_open
        }
    }

    #[derive(Debug)]
    struct Noop;

    impl ExtensionHooks for Noop {}

    #[test]
    fn defaults_are_no_ops() {
        let hooks = Noop;
        let mut vhost = VirtualHost::default();
        assert!(hooks.post_virtual_host(&mut vhost).is_ok());
        assert!(hooks.post_http_listener(&Listener::default()).expect("hook").is_none());
        assert!(hooks.post_translate(&[], &[]).expect("hook").is_empty());
        assert!(!hooks.fail_open());
    }

    #[test]
    fn failures_are_recorded_as_extension_errors() {
        let hooks = Failing { fail_open: false };
        let mut errors = ErrorList::new();
        let result = hooks.post_virtual_host(&mut VirtualHost::default());
        assert!(record_hook_result(&hooks, POST_VIRTUAL_HOST_HOOK, result, &mut errors).is_none());

        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors.all()[0],
            Error::Extension { hook: POST_VIRTUAL_HOST_HOOK, .. }
        ));
    }

    #[traced_test]
    #[test]
    fn fail_open_hooks_only_log() {
        let hooks = Failing { fail_open: true };
        let mut errors = ErrorList::new();
        let result = hooks.post_virtual_host(&mut VirtualHost::default());
        record_hook_result(&hooks, POST_VIRTUAL_HOST_HOOK, result, &mut errors);

        assert!(errors.is_empty());
        assert!(logs_contain("fail open"));
    }

    #[test]
    fn injected_resources_replace_by_name() {
        let mut table = ResourceTable::new();
        table.add(empty_cluster("backend")).expect("add");

        let mut replacement = empty_cluster("backend");
        replacement.alt_stat_name = "from-extension".to_string();
        InjectedResources {
            clusters: vec![replacement, empty_cluster("extra")],
            ..Default::default()
        }
        .apply(&mut table);

        assert_eq!(table.clusters().len(), 2);
        assert_eq!(
            table.find::<Cluster>("backend").map(|c| c.alt_stat_name.as_str()),
            Some("from-extension")
        );
    }
}
