//! # Route Matcher Compiler
//!
//! Turns the finished route list of one virtual host into a generic matcher
//! tree keyed on `:path`: an exact-match map, then a prefix-match map with
//! path-segment keys, then the linear fallback list. Routes whose path cannot
//! be expressed as a map key (regex, bare `/`, no path) stay in the fallback
//! tier in declaration order.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::route::v3::Route;
use envoy_types::pb::envoy::r#type::matcher::v3::HttpRequestHeaderMatchInput;
use envoy_types::pb::google::protobuf::Any;
use envoy_types::pb::xds::core::v3::TypedExtensionConfig;
use envoy_types::pb::xds::r#type::matcher::v3::matcher::matcher_tree::{MatchMap, TreeType};
use envoy_types::pb::xds::r#type::matcher::v3::matcher::{on_match, MatcherTree, MatcherType, OnMatch};
use envoy_types::pb::xds::r#type::matcher::v3::Matcher;
use prost::encoding::{encode_key, encode_varint, WireType};

use crate::ir::StringMatch;
use crate::xds::filters::{any_from_message, encode_with_sorted_map};

pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.Route";
pub const ROUTE_LIST_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteList";
const HEADER_INPUT_TYPE_URL: &str =
    "type.googleapis.com/envoy.type.matcher.v3.HttpRequestHeaderMatchInput";
const PATH_HEADER: &str = ":path";
/// Field number of `RouteList.routes`.
const ROUTE_LIST_ROUTES_TAG: u32 = 1;

/// Routes sharing one map key, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathGroup {
    pub routes: Vec<Route>,
}

/// The three matching tiers of a virtual host before they are encoded.
///
/// Map keys are kept in first-seen order so that compilation output is a
/// pure function of the route order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatcherPlan {
    groups: Vec<PathGroup>,
    exact: Vec<(String, usize)>,
    prefix: Vec<(String, usize)>,
    fallback: Vec<Route>,
}

impl MatcherPlan {
    /// Partition `(path match, route)` pairs into exact, prefix and fallback
    /// tiers.
    pub fn group<'a, I>(routes: I) -> Self
    where
        I: IntoIterator<Item = (Option<&'a StringMatch>, Route)>,
    {
        let mut plan = MatcherPlan::default();
        let mut exact_index: HashMap<String, usize> = HashMap::new();
        let mut prefix_index: HashMap<String, usize> = HashMap::new();

        for (path_match, route) in routes {
            let Some(path_match) = path_match else {
                plan.fallback.push(route);
                continue;
            };
            if path_match.safe_regex.is_some() {
                plan.fallback.push(route);
                continue;
            }

            if let Some(exact) = &path_match.exact {
                match exact_index.get(exact) {
                    Some(&group) => plan.groups[group].routes.push(route),
                    None => {
                        let group = plan.push_group(route);
                        exact_index.insert(exact.clone(), group);
                        plan.exact.push((exact.clone(), group));
                    }
                }
                continue;
            }

            if let Some(prefix) = &path_match.prefix {
                let trimmed = prefix.strip_suffix('/').unwrap_or(prefix);
                if trimmed.is_empty() {
                    plan.fallback.push(route);
                    continue;
                }
                let key = format!("{trimmed}/");
                match prefix_index.get(&key) {
                    Some(&group) => plan.groups[group].routes.push(route),
                    None => {
                        let group = plan.push_group(route);
                        prefix_index.insert(key.clone(), group);
                        plan.prefix.push((key, group));
                        // `/v2` must reach the routes of prefix `/v2/` too.
                        if !exact_index.contains_key(trimmed) {
                            exact_index.insert(trimmed.to_string(), group);
                            plan.exact.push((trimmed.to_string(), group));
                        }
                    }
                }
                continue;
            }

            plan.fallback.push(route);
        }
        plan
    }

    fn push_group(&mut self, route: Route) -> usize {
        self.groups.push(PathGroup { routes: vec![route] });
        self.groups.len() - 1
    }

    /// Exact keys and their routes, in first-seen order.
    pub fn exact_groups(&self) -> impl Iterator<Item = (&str, &[Route])> {
        self.exact.iter().map(|(key, group)| (key.as_str(), self.groups[*group].routes.as_slice()))
    }

    /// Prefix keys (always ending in `/`) and their routes.
    pub fn prefix_groups(&self) -> impl Iterator<Item = (&str, &[Route])> {
        self.prefix.iter().map(|(key, group)| (key.as_str(), self.groups[*group].routes.as_slice()))
    }

    pub fn fallback(&self) -> &[Route] {
        &self.fallback
    }

    /// Whether any route could be placed in a map tier.
    pub fn has_tree(&self) -> bool {
        !self.exact.is_empty() || !self.prefix.is_empty()
    }

    /// Candidate routes the compiled tree hands to a request for `path`:
    /// an exact hit, else the longest matching prefix key, else the fallback.
    pub fn lookup(&self, path: &str) -> Option<&[Route]> {
        if let Some((_, group)) = self.exact.iter().find(|(key, _)| key == path) {
            return Some(&self.groups[*group].routes);
        }
        let longest = self
            .prefix
            .iter()
            .filter(|(key, _)| path.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len());
        if let Some((_, group)) = longest {
            return Some(&self.groups[*group].routes);
        }
        (!self.fallback.is_empty()).then_some(self.fallback.as_slice())
    }

    /// Encode the plan. `None` when neither map has an entry, in which case
    /// the virtual host must keep linear routes.
    pub fn build(&self) -> Option<Matcher> {
        let mut fallback = (!self.fallback.is_empty()).then(|| OnMatch {
            on_match: Some(on_match::OnMatch::Action(route_list_action(&self.fallback))),
            keep_matching: false,
            ..Default::default()
        });

        let prefix_matcher = if self.prefix.is_empty() {
            None
        } else {
            Some(Matcher {
                matcher_type: Some(tree(TreeType::PrefixMatchMap(self.match_map(&self.prefix)))),
                on_no_match: fallback.take().map(Into::into),
                ..Default::default()
            })
        };

        if self.exact.is_empty() {
            return prefix_matcher;
        }

        let on_no_match = prefix_matcher
            .map(|matcher| OnMatch {
                on_match: Some(on_match::OnMatch::Matcher(matcher.into())),
                keep_matching: false,
                ..Default::default()
            })
            .or(fallback);
        Some(Matcher {
            matcher_type: Some(tree(TreeType::ExactMatchMap(self.match_map(&self.exact)))),
            on_no_match: on_no_match.map(Into::into),
            ..Default::default()
        })
    }

    fn match_map(&self, keys: &[(String, usize)]) -> MatchMap {
        MatchMap {
            map: keys
                .iter()
                .map(|(key, group)| (key.clone(), group_on_match(&self.groups[*group].routes)))
                .collect(),
            ..Default::default()
        }
    }
}

/// Compile `(path match, route)` pairs straight to a matcher tree.
pub fn build_virtual_host_matcher<'a, I>(routes: I) -> Option<Matcher>
where
    I: IntoIterator<Item = (Option<&'a StringMatch>, Route)>,
{
    MatcherPlan::group(routes).build()
}

fn tree(tree_type: TreeType) -> MatcherType {
    MatcherType::MatcherTree(
        MatcherTree { input: Some(path_input()), tree_type: Some(tree_type), ..Default::default() }.into(),
    )
}

fn path_input() -> TypedExtensionConfig {
    TypedExtensionConfig {
        name: "request-headers".to_string(),
        typed_config: Some(any_from_message(
            HEADER_INPUT_TYPE_URL,
            &HttpRequestHeaderMatchInput { header_name: PATH_HEADER.to_string(), ..Default::default() },
        )),
        ..Default::default()
    }
}

fn group_on_match(routes: &[Route]) -> OnMatch {
    let action = match routes {
        [single] => TypedExtensionConfig {
            name: "route".to_string(),
            typed_config: Some(Any { type_url: ROUTE_TYPE_URL.to_string(), value: route_bytes(single) }),
            ..Default::default()
        },
        many => route_list_action(many),
    };
    OnMatch { on_match: Some(on_match::OnMatch::Action(action)), keep_matching: false, ..Default::default() }
}

fn route_list_action(routes: &[Route]) -> TypedExtensionConfig {
    TypedExtensionConfig {
        name: "route_list".to_string(),
        typed_config: Some(Any { type_url: ROUTE_LIST_TYPE_URL.to_string(), value: route_list_bytes(routes) }),
        ..Default::default()
    }
}

/// Routes are packed into the tree as bytes, so their per-filter overrides
/// are written in name order to keep identical input byte-identical.
pub fn route_bytes(route: &Route) -> Vec<u8> {
    encode_with_sorted_map(route, |r: &mut Route| &mut r.typed_per_filter_config)
}

/// Wire form of a `RouteList` whose routes go through [`route_bytes`].
pub fn route_list_bytes(routes: &[Route]) -> Vec<u8> {
    let mut buf = Vec::new();
    for route in routes {
        let bytes = route_bytes(route);
        encode_key(ROUTE_LIST_ROUTES_TAG, WireType::LengthDelimited, &mut buf);
        encode_varint(bytes.len() as u64, &mut buf);
        buf.extend_from_slice(&bytes);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::route::v3::RouteList;
    use prost::Message;

    fn route(name: &str) -> Route {
        Route { name: name.to_string(), ..Default::default() }
    }

    fn names(routes: &[Route]) -> Vec<&str> {
        routes.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn partitions_routes_by_path_kind() {
        let login = StringMatch::exact("/login");
        let api = StringMatch::prefix("/api/");
        let regex = StringMatch::regex("^/v[0-9]+/.*");
        let root = StringMatch::prefix("/");

        let plan = MatcherPlan::group(vec![
            (Some(&login), route("login")),
            (Some(&api), route("api")),
            (Some(&regex), route("versioned")),
            (Some(&root), route("root")),
            (None, route("catch-all")),
        ]);

        let exact: Vec<_> = plan.exact_groups().map(|(k, r)| (k, names(r))).collect();
        assert_eq!(exact, vec![("/login", vec!["login"]), ("/api", vec!["api"])]);
        let prefix: Vec<_> = plan.prefix_groups().map(|(k, r)| (k, names(r))).collect();
        assert_eq!(prefix, vec![("/api/", vec!["api"])]);
        assert_eq!(names(plan.fallback()), vec!["versioned", "root", "catch-all"]);
    }

    #[test]
    fn routes_sharing_a_key_keep_declaration_order() {
        let path = StringMatch::exact("/same");
        let plan = MatcherPlan::group(
            (0..5).map(|i| (Some(&path), route(&format!("r{i}")))).collect::<Vec<_>>(),
        );
        let (_, routes) = plan.exact_groups().next().expect("one group");
        assert_eq!(names(routes), vec!["r0", "r1", "r2", "r3", "r4"]);
    }

    #[test]
    fn prefix_keys_follow_path_segments() {
        let v2 = StringMatch::prefix("/v2/");
        let plan = MatcherPlan::group(vec![(Some(&v2), route("v2"))]);

        for path in ["/v2", "/v2/", "/v2/foo"] {
            let hit = plan.lookup(path).map(names);
            assert_eq!(hit, Some(vec!["v2"]), "path {path}");
        }
        assert!(plan.lookup("/v2example").is_none());
    }

    #[test]
    fn prefix_without_trailing_slash_gets_the_same_key() {
        let a = StringMatch::prefix("/v2");
        let b = StringMatch::prefix("/v2/");
        let plan = MatcherPlan::group(vec![(Some(&a), route("a")), (Some(&b), route("b"))]);
        let prefix: Vec<_> = plan.prefix_groups().map(|(k, r)| (k, names(r))).collect();
        assert_eq!(prefix, vec![("/v2/", vec!["a", "b"])]);
    }

    #[test]
    fn only_one_trailing_slash_is_dropped() {
        let double = StringMatch::prefix("//");
        let root = StringMatch::prefix("/");
        let plan = MatcherPlan::group(vec![(Some(&double), route("double")), (Some(&root), route("root"))]);

        let prefix: Vec<_> = plan.prefix_groups().map(|(k, r)| (k, names(r))).collect();
        assert_eq!(prefix, vec![("//", vec!["double"])]);
        let exact: Vec<_> = plan.exact_groups().map(|(k, r)| (k, names(r))).collect();
        assert_eq!(exact, vec![("/", vec!["double"])]);
        assert_eq!(names(plan.fallback()), vec!["root"]);
    }

    fn with_overrides(name: &str, filters: &[&str]) -> Route {
        let mut route = route(name);
        for filter in filters {
            route.typed_per_filter_config.insert(
                filter.to_string(),
                Any { type_url: format!("type.googleapis.com/test.{filter}"), value: filter.as_bytes().to_vec() },
            );
        }
        route
    }

    const OVERRIDES: &[&str] = &[
        "envoy.filters.http.oauth2/login",
        "envoy.filters.http.cors",
        "envoy.filters.http.basic_auth/login",
        "envoy.filters.http.local_ratelimit",
        "envoy.filters.http.jwt_authn",
        "envoy.filters.http.ext_authz/login",
    ];

    #[test]
    fn route_overrides_encode_in_name_order() {
        let mut reversed = OVERRIDES.to_vec();
        reversed.reverse();

        let first = route_bytes(&with_overrides("login", OVERRIDES));
        for _ in 0..16 {
            assert_eq!(route_bytes(&with_overrides("login", &reversed)), first);
        }
        let decoded = Route::decode(first.as_slice()).expect("route");
        assert_eq!(decoded, with_overrides("login", OVERRIDES));
    }

    #[test]
    fn compiled_tree_is_identical_across_builds() {
        let login = StringMatch::exact("/login");
        let shared = StringMatch::exact("/shared");
        let compile = || {
            build_virtual_host_matcher(vec![
                (Some(&login), with_overrides("login", OVERRIDES)),
                (Some(&shared), with_overrides("a", OVERRIDES)),
                (Some(&shared), with_overrides("b", &OVERRIDES[..3])),
                (None, with_overrides("default", OVERRIDES)),
            ])
            .expect("tree")
        };

        let first = compile();
        for _ in 0..16 {
            assert_eq!(compile(), first);
        }

        let Some(MatcherType::MatcherTree(root)) = &first.matcher_type else {
            panic!("expected matcher tree");
        };
        let Some(TreeType::ExactMatchMap(exact)) = &root.tree_type else {
            panic!("expected exact map");
        };
        let Some(on_match::OnMatch::Action(action)) = exact.map.get("/shared").and_then(|m| m.on_match.as_ref())
        else {
            panic!("expected a route list for /shared");
        };
        let any = action.typed_config.as_ref().expect("typed config");
        let list = RouteList::decode(any.value.as_slice()).expect("route list");
        assert_eq!(list.routes, vec![with_overrides("a", OVERRIDES), with_overrides("b", &OVERRIDES[..3])]);
    }

    #[test]
    fn longest_prefix_wins() {
        let short = StringMatch::prefix("/api");
        let long = StringMatch::prefix("/api/v1");
        let plan =
            MatcherPlan::group(vec![(Some(&short), route("short")), (Some(&long), route("long"))]);
        assert_eq!(plan.lookup("/api/v1/users").map(names), Some(vec!["long"]));
        assert_eq!(plan.lookup("/api/v2").map(names), Some(vec!["short"]));
    }

    #[test]
    fn only_fallback_routes_yield_no_tree() {
        let regex = StringMatch::regex(".*");
        let plan = MatcherPlan::group(vec![(Some(&regex), route("re")), (None, route("all"))]);
        assert!(!plan.has_tree());
        assert!(plan.build().is_none());
        assert!(build_virtual_host_matcher(Vec::new()).is_none());
    }

    #[test]
    fn exact_tree_nests_prefix_then_fallback() {
        let login = StringMatch::exact("/login");
        let api = StringMatch::prefix("/api/");
        let matcher = build_virtual_host_matcher(vec![
            (Some(&login), route("login")),
            (Some(&api), route("api")),
            (None, route("default")),
        ])
        .expect("tree");

        let Some(MatcherType::MatcherTree(root)) = &matcher.matcher_type else {
            panic!("expected matcher tree at the root");
        };
        let Some(TreeType::ExactMatchMap(exact)) = &root.tree_type else {
            panic!("expected exact map at the root");
        };
        assert!(exact.map.contains_key("/login"));
        assert!(exact.map.contains_key("/api"));

        let single = exact.map.get("/login").and_then(|m| m.on_match.as_ref());
        let Some(on_match::OnMatch::Action(action)) = single else {
            panic!("expected an action for /login");
        };
        assert_eq!(action.name, "route");
        let any = action.typed_config.as_ref().expect("typed config");
        assert_eq!(Route::decode(any.value.as_slice()).expect("route").name, "login");

        let nested = matcher.on_no_match.as_ref().and_then(|m| m.on_match.as_ref());
        let Some(on_match::OnMatch::Matcher(prefix)) = nested else {
            panic!("expected the prefix matcher under on_no_match");
        };
        let Some(MatcherType::MatcherTree(prefix_tree)) = &prefix.matcher_type else {
            panic!("expected prefix tree");
        };
        let Some(TreeType::PrefixMatchMap(prefix_map)) = &prefix_tree.tree_type else {
            panic!("expected prefix map");
        };
        assert!(prefix_map.map.contains_key("/api/"));

        let fallback = prefix.on_no_match.as_ref().and_then(|m| m.on_match.as_ref());
        let Some(on_match::OnMatch::Action(fallback)) = fallback else {
            panic!("expected the fallback route list");
        };
        assert_eq!(fallback.name, "route_list");
    }

    #[test]
    fn prefix_only_tree_starts_with_prefix_map() {
        let api = StringMatch::prefix("/api/");
        let plan = MatcherPlan { exact: Vec::new(), ..MatcherPlan::group(vec![(Some(&api), route("api"))]) };
        let matcher = plan.build().expect("tree");
        let Some(MatcherType::MatcherTree(root)) = &matcher.matcher_type else {
            panic!("expected matcher tree");
        };
        assert!(matches!(root.tree_type, Some(TreeType::PrefixMatchMap(_))));
        assert!(matcher.on_no_match.is_none());
    }
}
