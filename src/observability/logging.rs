//! # Structured Logging
//!
//! Subscriber setup plus span helpers used by the translation pipeline.

use tracing::Dispatch;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_level`. Returns `false` when a subscriber
/// was already installed, which happens in tests and when embedding.
pub fn init_logging(default_level: &str, format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing::dispatcher::set_global_default(log_dispatch(filter, format)).is_ok()
}

/// Subscriber writing to stderr in `format`, not yet installed anywhere.
pub fn log_dispatch(filter: EnvFilter, format: LogFormat) -> Dispatch {
    let builder = FmtSubscriber::builder().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => Dispatch::new(builder.finish()),
        LogFormat::Json => Dispatch::new(builder.json().finish()),
    }
}

/// Span covering one translation run
#[macro_export]
macro_rules! translate_span {
    ($http:expr, $tcp:expr) => {
        tracing::info_span!("translate", http_listeners = $http, tcp_listeners = $tcp)
    };
}

/// Span covering the translation of one IR listener
#[macro_export]
macro_rules! listener_span {
    ($kind:expr, $name:expr) => {
        tracing::debug_span!("listener", kind = $kind, name = %$name)
    };
    ($kind:expr, $name:expr, $($field:tt)*) => {
        tracing::debug_span!("listener", kind = $kind, name = %$name, $($field)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = translate_span!(2, 1);
        let _span = listener_span!("http", "first-listener");
        let _span = listener_span!("tcp", "db", port = 5432);
    }

    #[test]
    fn dispatch_applies_its_filter_in_scope() {
        for format in [LogFormat::Text, LogFormat::Json] {
            let dispatch = log_dispatch(EnvFilter::new("warn"), format);
            tracing::dispatcher::with_default(&dispatch, || {
                assert!(tracing::enabled!(tracing::Level::WARN));
                assert!(!tracing::enabled!(tracing::Level::DEBUG));
            });
        }
    }
}
