//! Route building from IR routes.
//!
//! Each IR route becomes one Envoy `Route`: match, action and header
//! mutation are built here, then every filter plugin attaches its per-route
//! configuration through the registry.

use envoy_types::pb::envoy::config::core::v3::{
    data_source::Specifier, header_value_option::HeaderAppendAction, DataSource, HeaderValue,
    HeaderValueOption,
};
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier,
    query_parameter_matcher::QueryParameterMatchSpecifier,
    redirect_action::{PathRewriteSpecifier, RedirectResponseCode, SchemeRewriteSpecifier},
    route::Action,
    route_action::{ClusterNotFoundResponseCode, ClusterSpecifier},
    route_match::PathSpecifier,
    DirectResponseAction, HeaderMatcher, QueryParameterMatcher, RedirectAction, Route,
    RouteAction, RouteConfiguration, RouteMatch,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatcher, StringMatcher,
};
use http::header::HeaderName;

use crate::errors::{Error, ErrorList, Result};
use crate::ir::{AddHeader, DirectResponse, HttpListener, HttpRoute, Redirect, StringMatch};
use crate::xds::filters::duration_from_millis;
use crate::xds::filters::http::FilterRegistry;

/// Build the Envoy route for `ir_route` and let every filter plugin patch it.
///
/// All failures are attributed to the route; a route that fails any step
/// must not be added to its virtual host.
pub fn build_xds_route(
    ir_route: &HttpRoute,
    listener: &HttpListener,
    registry: &FilterRegistry,
) -> std::result::Result<Route, ErrorList> {
    let mut route = build_route(ir_route).map_err(|e| ErrorList::from(e.for_route(&ir_route.name)))?;
    registry
        .patch_route(&mut route, ir_route, listener)
        .map_err(|errors| errors.for_route(&ir_route.name))?;
    Ok(route)
}

fn build_route(ir_route: &HttpRoute) -> Result<Route> {
    let mut route = Route {
        name: ir_route.name.clone(),
        r#match: Some(build_route_match(
            ir_route.path_match.as_ref(),
            &ir_route.header_matches,
            &ir_route.query_param_matches,
        )?),
        action: Some(build_action(ir_route)?),
        request_headers_to_remove: ir_route.remove_request_headers.clone(),
        ..Default::default()
    };

    route.request_headers_to_add = ir_route
        .add_request_headers
        .iter()
        .map(build_header_value_option)
        .collect::<Result<_>>()?;
    for name in &route.request_headers_to_remove {
        validate_header_name(name)?;
    }

    Ok(route)
}

pub fn build_route_match(
    path: Option<&StringMatch>,
    headers: &[StringMatch],
    query_params: &[StringMatch],
) -> Result<RouteMatch> {
    let path_specifier = match path {
        None => PathSpecifier::Prefix("/".to_string()),
        Some(path) => build_path_specifier(path)?,
    };

    let headers = headers.iter().map(build_header_matcher).collect::<Result<Vec<_>>>()?;

    let query_parameters = query_params
        .iter()
        .map(|param| {
            if param.name.trim().is_empty() {
                return Err(Error::config("query parameter match requires a name"));
            }
            if param.invert {
                return Err(Error::config(format!(
                    "query parameter match '{}' cannot be inverted",
                    param.name
                )));
            }
            Ok(QueryParameterMatcher {
                name: param.name.clone(),
                query_parameter_match_specifier: Some(QueryParameterMatchSpecifier::StringMatch(
                    build_string_matcher(param)?,
                )),
                ..Default::default()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RouteMatch {
        path_specifier: Some(path_specifier),
        headers,
        query_parameters,
        ..Default::default()
    })
}

/// Header matcher keeping the inversion flag of the IR match.
pub fn build_header_matcher(header: &StringMatch) -> Result<HeaderMatcher> {
    validate_header_name(&header.name)?;
    Ok(HeaderMatcher {
        name: header.name.clone(),
        invert_match: header.invert,
        header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(build_string_matcher(
            header,
        )?)),
        ..Default::default()
    })
}

/// Path specifier of a route. Prefixes other than `/` match on whole path
/// segments; suffix and substring matches fall back to a regex.
fn build_path_specifier(path: &StringMatch) -> Result<PathSpecifier> {
    path.validate()?;
    let specifier = if let Some(exact) = &path.exact {
        PathSpecifier::Path(exact.clone())
    } else if let Some(prefix) = &path.prefix {
        if prefix == "/" {
            PathSpecifier::Prefix(prefix.clone())
        } else {
            PathSpecifier::PathSeparatedPrefix(prefix.trim_end_matches('/').to_string())
        }
    } else if let Some(suffix) = &path.suffix {
        PathSpecifier::SafeRegex(regex_matcher(format!(".*{}", regex::escape(suffix))))
    } else if let Some(contains) = &path.contains {
        PathSpecifier::SafeRegex(regex_matcher(format!(".*{}.*", regex::escape(contains))))
    } else if let Some(pattern) = &path.safe_regex {
        PathSpecifier::SafeRegex(regex_matcher(pattern.clone()))
    } else {
        return Err(Error::config("path match has no pattern"));
    };

    if path.invert {
        return Err(Error::config("path matches cannot be inverted"));
    }
    Ok(specifier)
}

fn regex_matcher(regex: String) -> RegexMatcher {
    RegexMatcher { regex, ..Default::default() }
}

/// Envoy string matcher for a header, query parameter or CORS origin match.
pub fn build_string_matcher(matcher: &StringMatch) -> Result<StringMatcher> {
    matcher.validate()?;
    let match_pattern = if let Some(exact) = &matcher.exact {
        MatchPattern::Exact(exact.clone())
    } else if let Some(prefix) = &matcher.prefix {
        MatchPattern::Prefix(prefix.clone())
    } else if let Some(suffix) = &matcher.suffix {
        MatchPattern::Suffix(suffix.clone())
    } else if let Some(contains) = &matcher.contains {
        MatchPattern::Contains(contains.clone())
    } else if let Some(pattern) = &matcher.safe_regex {
        MatchPattern::SafeRegex(regex_matcher(pattern.clone()))
    } else {
        return Err(Error::config("string match has no pattern"));
    };

    Ok(StringMatcher { match_pattern: Some(match_pattern), ignore_case: false, ..Default::default() })
}

fn build_action(ir_route: &HttpRoute) -> Result<Action> {
    if let Some(response) = &ir_route.direct_response {
        return build_direct_response(response).map(Action::DirectResponse);
    }
    if let Some(redirect) = &ir_route.redirect {
        return build_redirect(redirect).map(Action::Redirect);
    }
    let Some(destination) = &ir_route.destination else {
        return Err(Error::config(
            "route has neither a destination, a redirect nor a direct response",
        ));
    };

    #[allow(deprecated)]
    let mut action = RouteAction {
        cluster_specifier: Some(ClusterSpecifier::Cluster(destination.name.clone())),
        timeout: ir_route.timeout_ms.map(duration_from_millis),
        ..Default::default()
    };
    if !destination.has_endpoints() {
        action.cluster_not_found_response_code =
            ClusterNotFoundResponseCode::InternalServerError as i32;
    }
    Ok(Action::Route(action))
}

fn build_direct_response(response: &DirectResponse) -> Result<DirectResponseAction> {
    if !(200..600).contains(&response.status_code) {
        return Err(Error::config(format!(
            "direct response status {} is outside 200-599",
            response.status_code
        )));
    }
    Ok(DirectResponseAction {
        status: response.status_code,
        body: response.body.as_ref().filter(|body| !body.is_empty()).map(|body| DataSource {
            specifier: Some(Specifier::InlineString(body.clone())),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn build_redirect(redirect: &Redirect) -> Result<RedirectAction> {
    let response_code = match redirect.status_code {
        None | Some(301) => RedirectResponseCode::MovedPermanently,
        Some(302) => RedirectResponseCode::Found,
        Some(303) => RedirectResponseCode::SeeOther,
        Some(307) => RedirectResponseCode::TemporaryRedirect,
        Some(308) => RedirectResponseCode::PermanentRedirect,
        Some(other) => {
            return Err(Error::config(format!("unsupported redirect status code {other}")))
        }
    };

    Ok(RedirectAction {
        scheme_rewrite_specifier: redirect.scheme.clone().map(SchemeRewriteSpecifier::SchemeRedirect),
        host_redirect: redirect.hostname.clone().unwrap_or_default(),
        // Well-known ports stay out of the Location header.
        port_redirect: redirect.port.filter(|port| *port != 80 && *port != 443).unwrap_or_default(),
        path_rewrite_specifier: redirect.path.clone().map(PathRewriteSpecifier::PathRedirect),
        response_code: response_code as i32,
        ..Default::default()
    })
}

fn build_header_value_option(header: &AddHeader) -> Result<HeaderValueOption> {
    validate_header_name(&header.name)?;
    let append_action = if header.append {
        HeaderAppendAction::AppendIfExistsOrAdd
    } else {
        HeaderAppendAction::OverwriteIfExistsOrAdd
    };
    Ok(HeaderValueOption {
        header: Some(HeaderValue {
            key: header.name.clone(),
            value: header.value.clone(),
            ..Default::default()
        }),
        append_action: append_action as i32,
        ..Default::default()
    })
}

/// Pseudo-headers such as `:authority` are accepted.
fn validate_header_name(name: &str) -> Result<()> {
    let bare = name.strip_prefix(':').unwrap_or(name);
    HeaderName::from_bytes(bare.to_ascii_lowercase().as_bytes())
        .map(|_| ())
        .map_err(|_| Error::config(format!("invalid header name '{name}'")))
}

/// Route configuration served for one listener socket.
pub fn new_route_configuration(name: &str) -> RouteConfiguration {
    RouteConfiguration {
        name: name.to_string(),
        ignore_port_in_host_matching: true,
        ..Default::default()
    }
}

/// `<listener>/<hostname with . replaced by _>`
pub fn virtual_host_name(listener: &str, hostname: &str) -> String {
    format!("{}/{}", listener, hostname.replace('.', "_"))
}
