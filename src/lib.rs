//! # xDS Translator
//!
//! Translation engine of a Kubernetes-native API gateway: converts the
//! gateway's intermediate representation of listeners, routes and backends
//! into the Envoy resources served over xDS.
//!
//! ## Architecture
//!
//! ```text
//! IR (listeners, routes) → Translator → ResourceTable → discovery server / golden files
//!                              ↓
//!            FilterRegistry · RouteMatcher · ExtensionHooks
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use xds_translator::{ir::Xds, Translator, TranslatorSettings};
//!
//! fn main() -> xds_translator::Result<()> {
//!     let ir = Xds::from_yaml(&std::fs::read_to_string("ir.yaml")?)?;
//!     let translation = Translator::new(TranslatorSettings::default()).translate(&ir)?;
//!     println!("{} clusters", translation.table.clusters().len());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod errors;
pub mod ir;
pub mod observability;
pub mod xds;

pub use config::TranslatorSettings;
pub use errors::{Error, ErrorList, Result};
pub use xds::{ResourceTable, Translation, Translator};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "xds-translator");
    }
}
