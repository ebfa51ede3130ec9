//! # Configuration Management
//!
//! Translator settings are read from an optional YAML file, then overridden
//! from the environment and validated before a translator is built.

pub mod settings;

pub use settings::{GlobalRateLimitSettings, TranslatorSettings, ENV_RATELIMIT_URL, ENV_ROUTE_MATCHER};

use std::path::Path;

use crate::Result;

/// Resolve the settings used by the CLI: file (or defaults), then
/// environment overrides, then validation.
pub fn load_settings(path: Option<&Path>) -> Result<TranslatorSettings> {
    let settings = match path {
        Some(path) => TranslatorSettings::from_file(path)?,
        None => TranslatorSettings::default(),
    }
    .with_env_overrides()?;
    settings.validate()?;
    Ok(settings)
}
