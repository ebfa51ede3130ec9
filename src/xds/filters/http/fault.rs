//! Fault injection filter.
//!
//! A generic `HTTPFault` sits in the chain and each route carries its own
//! delay/abort settings as a per-route override.

use envoy_types::pb::envoy::config::route::v3::Route;
use envoy_types::pb::envoy::extensions::filters::common::fault::v3::{
    fault_delay::FaultDelaySecifier, FaultDelay,
};
use envoy_types::pb::envoy::extensions::filters::http::fault::v3::{
    fault_abort::ErrorType, FaultAbort, HttpFault,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;

use super::{hcm_contains_filter, set_route_filter_config, typed_filter, FilterType, HttpFilterPlugin};
use crate::errors::ErrorList;
use crate::ir::{FaultInjection, HttpListener, HttpRoute};
use crate::xds::filters::{any_from_message, duration_from_millis, fractional_percent, invalid_config};

pub const FAULT_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.fault.v3.HTTPFault";

#[derive(Debug, Default)]
pub struct FaultFilter;

impl HttpFilterPlugin for FaultFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Fault
    }

    fn patch_hcm(
        &self,
        hcm: &mut HttpConnectionManager,
        listener: &HttpListener,
    ) -> Result<(), ErrorList> {
        let name = FilterType::Fault.filter_name();
        if !listener.any_route(|r| r.fault().is_some()) || hcm_contains_filter(hcm, name) {
            return Ok(());
        }
        hcm.http_filters.push(typed_filter(name, FAULT_TYPE_URL, &HttpFault::default()));
        Ok(())
    }

    fn patch_route(
        &self,
        route: &mut Route,
        ir_route: &HttpRoute,
        _listener: &HttpListener,
    ) -> crate::Result<()> {
        let Some(fault) = ir_route.fault() else {
            return Ok(());
        };
        let Some(config) = build_route_fault(fault)? else {
            return Ok(());
        };
        set_route_filter_config(
            route,
            FilterType::Fault.filter_name(),
            any_from_message(FAULT_TYPE_URL, &config),
        )
    }
}

/// Per-route fault config; `None` when neither delay nor abort is set.
pub fn build_route_fault(fault: &FaultInjection) -> crate::Result<Option<HttpFault>> {
    let delay = fault
        .delay
        .as_ref()
        .map(|delay| -> crate::Result<FaultDelay> {
            Ok(FaultDelay {
                percentage: delay.percentage.map(fractional_percent).transpose()?,
                fault_delay_secifier: Some(FaultDelaySecifier::FixedDelay(duration_from_millis(
                    delay.fixed_delay_ms,
                ))),
                ..Default::default()
            })
        })
        .transpose()?;

    let abort = fault
        .abort
        .as_ref()
        .map(|abort| -> crate::Result<FaultAbort> {
            let error_type = match (abort.http_status, abort.grpc_status) {
                (Some(_), Some(_)) => {
                    return Err(invalid_config("fault abort sets both http and grpc status"))
                }
                (Some(status), None) if !(200..600).contains(&status) => {
                    return Err(invalid_config(format!(
                        "fault abort http status {status} is outside 200-599"
                    )))
                }
                (Some(status), None) => Some(ErrorType::HttpStatus(status)),
                (None, Some(status)) => Some(ErrorType::GrpcStatus(status)),
                (None, None) => None,
            };
            Ok(FaultAbort {
                percentage: abort.percentage.map(fractional_percent).transpose()?,
                error_type,
                ..Default::default()
            })
        })
        .transpose()?;

    if delay.is_none() && abort.is_none() {
        return Ok(None);
    }
    Ok(Some(HttpFault { delay, abort, ..Default::default() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FaultAbort as IrAbort, FaultDelay as IrDelay, TrafficFeatures};

    fn route_with_fault(fault: FaultInjection) -> HttpRoute {
        let mut route = HttpRoute::new("faulty");
        route.traffic =
            Some(TrafficFeatures { fault_injection: Some(fault), ..Default::default() });
        route
    }

    #[test]
    fn builds_delay_and_abort() {
        let config = build_route_fault(&FaultInjection {
            delay: Some(IrDelay { fixed_delay_ms: 1500, percentage: Some(50.0) }),
            abort: Some(IrAbort { http_status: Some(503), grpc_status: None, percentage: None }),
        })
        .expect("valid fault")
        .expect("fault config");

        let delay = config.delay.expect("delay");
        assert_eq!(delay.percentage.map(|p| p.numerator), Some(500_000));
        assert!(matches!(
            delay.fault_delay_secifier,
            Some(FaultDelaySecifier::FixedDelay(ref d)) if d.seconds == 1 && d.nanos == 500_000_000
        ));
        assert_eq!(config.abort.and_then(|a| a.error_type), Some(ErrorType::HttpStatus(503)));
    }

    #[test]
    fn rejects_out_of_range_status() {
        let err = build_route_fault(&FaultInjection {
            delay: None,
            abort: Some(IrAbort { http_status: Some(1000), ..Default::default() }),
        })
        .expect_err("invalid status");
        assert!(err.to_string().contains("1000"));
    }

    #[test]
    fn empty_fault_adds_nothing() {
        let listener = HttpListener::new("l1", "0.0.0.0", 80)
            .with_route(route_with_fault(FaultInjection::default()));
        let mut route = Route::default();
        FaultFilter.patch_route(&mut route, &listener.routes[0], &listener).expect("patch route");
        assert!(route.typed_per_filter_config.is_empty());

        let mut hcm = HttpConnectionManager::default();
        FaultFilter.patch_hcm(&mut hcm, &listener).expect("patch hcm");
        FaultFilter.patch_hcm(&mut hcm, &listener).expect("patch hcm again");
        assert_eq!(hcm.http_filters.len(), 1);
    }
}
