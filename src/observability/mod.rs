//! # Observability
//!
//! Structured logging for the translator. Library code only emits `tracing`
//! events and spans; binaries decide where they go by calling
//! [`init_logging`].

pub mod logging;

pub use logging::{init_logging, LogFormat};
