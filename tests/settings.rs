//! Loading translator settings from files and feeding them to a translation.

mod common;

use std::io::Write;

use tempfile::NamedTempFile;
use xds_translator::config::load_settings;
use xds_translator::ir::{StringMatch, Xds};
use xds_translator::xds::listener::find_hcm;
use xds_translator::{Error, Translator};

use common::*;

fn settings_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write settings");
    file
}

#[test]
fn settings_load_from_yaml_file() {
    let file = settings_file(
        r#"
route_matcher: false
hmac_secret_length: 48
global_rate_limit:
  service_url: grpc://ratelimit.infra:8081
  timeout_ms: 250
"#,
    );

    let settings = load_settings(Some(file.path())).expect("load settings");
    assert!(!settings.route_matcher);
    assert_eq!(settings.hmac_secret_length, 48);
    let global = settings.global_rate_limit.expect("rate limit settings");
    assert_eq!(global.timeout_ms, Some(250));
    assert!(!global.failure_mode_deny);
}

#[test]
fn out_of_range_values_fail_validation() {
    let file = settings_file("hmac_secret_length: 4\n");
    let err = load_settings(Some(file.path())).expect_err("invalid settings");
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn malformed_yaml_is_a_serialization_error() {
    let file = settings_file("route_matcher: [not, a, bool]\n");
    let err = load_settings(Some(file.path())).expect_err("malformed settings");
    assert!(matches!(err, Error::Serialization(_)));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = load_settings(Some(dir.path().join("absent.yaml").as_path())).expect_err("missing file");
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn custom_filter_order_reaches_the_filter_chain() {
    let file = settings_file(
        r#"
filter_order:
  - name: envoy.filters.http.oauth2
    before: envoy.filters.http.cors
"#,
    );
    let settings = load_settings(Some(file.path())).expect("load settings");

    let login = with_cors(
        with_oidc(route("login", StringMatch::exact("/login"))),
        vec![StringMatch::exact("https://app.example.com")],
    );
    let ir = Xds { http: vec![listener("l1", 8080, vec![login])], tcp: vec![] };
    let translation = Translator::new(settings).translate(&ir).expect("translate");
    assert!(!translation.has_errors(), "{}", translation.errors);

    let chain = translation.table.listeners()[0].default_filter_chain.as_ref().expect("chain");
    let hcm = find_hcm(chain).expect("decode").expect("hcm");
    let filters: Vec<&str> = hcm.http_filters.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(
        filters,
        vec!["envoy.filters.http.oauth2/login", "envoy.filters.http.cors", "envoy.filters.http.router"]
    );
}
