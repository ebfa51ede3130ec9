//! Ordering invariants of the HTTP filter chain.

use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpFilter;
use proptest::prelude::*;
use xds_translator::xds::filters::http::{
    filter_priority, sort_http_filters, FilterPosition, FilterType, ROUTER_FILTER_NAME,
};

const NAME_POOL: &[&str] = &[
    "envoy.filters.http.health_check",
    "envoy.filters.http.fault",
    "envoy.filters.http.cors",
    "envoy.filters.http.ext_authz/route-a",
    "envoy.filters.http.ext_authz/route-b",
    "envoy.filters.http.basic_auth/route-a",
    "envoy.filters.http.oauth2/route-a",
    "envoy.filters.http.oauth2/route-b",
    "envoy.filters.http.jwt_authn",
    "envoy.filters.http.ext_proc/policy/0",
    "envoy.filters.http.ext_proc/policy/1",
    "envoy.filters.http.wasm/ext/3",
    "envoy.filters.http.local_ratelimit",
    "envoy.filters.http.ratelimit",
    "envoy.filters.http.credential_injector/route-a",
    "envoy.filters.http.compressor.gzip",
    "envoy.filters.http.compressor.brotli",
    "acme.filters.http.audit",
    "acme.filters.http.geoip",
    "vendor.custom",
];

fn filter(name: &str) -> HttpFilter {
    HttpFilter { name: name.to_string(), ..Default::default() }
}

fn names(filters: &[HttpFilter]) -> Vec<String> {
    filters.iter().map(|f| f.name.clone()).collect()
}

/// Distinct filter names in arbitrary order, plus the router somewhere.
fn chain() -> impl Strategy<Value = Vec<String>> {
    (prop::sample::subsequence(NAME_POOL.to_vec(), 0..NAME_POOL.len()), any::<prop::sample::Index>())
        .prop_flat_map(|(picked, router_at)| {
            let mut picked: Vec<String> = picked.into_iter().map(str::to_string).collect();
            let at = router_at.index(picked.len() + 1);
            picked.insert(at, ROUTER_FILTER_NAME.to_string());
            Just(picked).prop_shuffle()
        })
}

fn position() -> impl Strategy<Value = FilterPosition> {
    let types = prop::sample::select(FilterType::ALL.to_vec());
    (types.clone(), types, any::<bool>()).prop_map(|(name, anchor, before)| {
        if before {
            FilterPosition::before(name, anchor)
        } else {
            FilterPosition::after(name, anchor)
        }
    })
}

proptest! {
    #[test]
    fn router_is_always_last(input in chain(), positions in prop::collection::vec(position(), 0..4)) {
        let sorted = sort_http_filters(input.iter().map(|n| filter(n)).collect(), &positions);
        prop_assert_eq!(sorted.len(), input.len());
        prop_assert_eq!(sorted.last().map(|f| f.name.as_str()), Some(ROUTER_FILTER_NAME));
    }

    #[test]
    fn cors_precedes_every_higher_priority_filter(input in chain()) {
        let sorted = names(&sort_http_filters(input.iter().map(|n| filter(n)).collect(), &[]));
        if let Some(cors) = sorted.iter().position(|n| n == "envoy.filters.http.cors") {
            let cors_priority = filter_priority("envoy.filters.http.cors");
            for (index, name) in sorted.iter().enumerate() {
                if filter_priority(name) > cors_priority {
                    prop_assert!(cors < index, "{} placed before cors", name);
                }
            }
        }
    }

    #[test]
    fn equal_priorities_keep_input_order(input in chain()) {
        let sorted = names(&sort_http_filters(input.iter().map(|n| filter(n)).collect(), &[]));

        let priorities: Vec<u32> = sorted.iter().map(|n| filter_priority(n)).collect();
        prop_assert!(priorities.windows(2).all(|pair| pair[0] <= pair[1]));

        for priority in priorities.iter().copied() {
            let from_input: Vec<&String> =
                input.iter().filter(|n| filter_priority(n) == priority).collect();
            let from_output: Vec<&String> =
                sorted.iter().filter(|n| filter_priority(n) == priority).collect();
            prop_assert_eq!(from_input, from_output);
        }
    }

    #[test]
    fn sorting_is_idempotent(input in chain()) {
        let once = sort_http_filters(input.iter().map(|n| filter(n)).collect(), &[]);
        let twice = sort_http_filters(once.clone(), &[]);
        prop_assert_eq!(names(&once), names(&twice));
    }
}

#[test]
fn default_priority_filters_sit_between_authentication_and_rate_limiting() {
    let sorted = sort_http_filters(
        vec![
            filter("envoy.filters.http.ratelimit"),
            filter("acme.filters.http.audit"),
            filter(ROUTER_FILTER_NAME),
            filter("envoy.filters.http.jwt_authn"),
            filter("envoy.filters.http.cors"),
        ],
        &[],
    );
    assert_eq!(
        names(&sorted),
        vec![
            "envoy.filters.http.cors",
            "envoy.filters.http.jwt_authn",
            "acme.filters.http.audit",
            "envoy.filters.http.ratelimit",
            ROUTER_FILTER_NAME,
        ]
    );
}
